//! Access to the cluster objects the controller reads and creates
use async_trait::async_trait;
use futures::{stream::BoxStream, Future, StreamExt};
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service, networking::v1::Ingress};
use kube::{
    api::{Api, PostParams},
    error::ErrorResponse,
    runtime::{watcher, WatchStreamExt},
    Client, ResourceExt,
};
use std::time::Duration;
use thiserror::Error;

/// Failure of a single request to the cluster
#[derive(Debug, Error)]
pub enum ClientError {
    /// An object with the same namespace and name exists already
    #[error("object already exists")]
    AlreadyExists,
    /// The object to create does not say which namespace it belongs to
    #[error("object has no namespace")]
    MissingNamespace,
    /// The request did not complete within its deadline
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// Any other api or transport failure
    #[error("api request failed: {0}")]
    Kube(#[source] kube::Error),
}

impl From<kube::Error> for ClientError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ErrorResponse { code: 409, ref reason, .. }) if reason == "AlreadyExists" => {
                Self::AlreadyExists
            }
            err => Self::Kube(err),
        }
    }
}

/// The cluster operations the controller depends on
///
/// Implemented by [`KubeClient`] against a real cluster. Every call is namespace scoped
/// except for the Deployment watch, which covers whatever the implementation is configured to see.
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// Watch all visible Deployments, recovering from errors by itself
    fn watch_deployments(&self) -> BoxStream<'static, Result<watcher::Event<Deployment>, watcher::Error>>;

    /// Look up a Service, `None` if it does not exist
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, ClientError>;

    /// Create a Service in its own namespace
    async fn create_service(&self, service: &Service) -> Result<Service, ClientError>;

    /// Create an Ingress in its own namespace
    async fn create_ingress(&self, ingress: &Ingress) -> Result<Ingress, ClientError>;
}

/// [`ClusterClient`] backed by a [`kube::Client`]
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    namespace: Option<String>,
    request_timeout: Duration,
}

impl KubeClient {
    /// Watch Deployments in all namespaces, with a 10s deadline on every other request
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            namespace: None,
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Only watch Deployments in `namespace`
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Deadline for get and create requests
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn with_deadline<T>(
        &self,
        request: impl Future<Output = Result<T, kube::Error>>,
    ) -> Result<T, ClientError> {
        tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| ClientError::Timeout(self.request_timeout))?
            .map_err(ClientError::from)
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    fn watch_deployments(&self) -> BoxStream<'static, Result<watcher::Event<Deployment>, watcher::Error>> {
        let api: Api<Deployment> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        watcher(api, watcher::Config::default()).default_backoff().boxed()
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, ClientError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        self.with_deadline(api.get_opt(name)).await
    }

    async fn create_service(&self, service: &Service) -> Result<Service, ClientError> {
        let ns = service.namespace().ok_or(ClientError::MissingNamespace)?;
        let api: Api<Service> = Api::namespaced(self.client.clone(), &ns);
        self.with_deadline(api.create(&PostParams::default(), service)).await
    }

    async fn create_ingress(&self, ingress: &Ingress) -> Result<Ingress, ClientError> {
        let ns = ingress.namespace().ok_or(ClientError::MissingNamespace)?;
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &ns);
        self.with_deadline(api.create(&PostParams::default(), ingress)).await
    }
}
