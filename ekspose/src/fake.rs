//! In-memory [`ClusterClient`] for tests
use crate::client::{ClientError, ClusterClient};
use async_trait::async_trait;
use futures::{
    channel::mpsc,
    stream::{self, BoxStream},
    StreamExt,
};
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service, networking::v1::Ingress};
use kube::{runtime::watcher, ResourceExt};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

pub type WatchEvents = mpsc::UnboundedSender<Result<watcher::Event<Deployment>, watcher::Error>>;

#[derive(Default)]
struct State {
    services: BTreeMap<(String, String), Service>,
    ingresses: BTreeMap<(String, String), Ingress>,
    watch: Option<mpsc::UnboundedReceiver<Result<watcher::Event<Deployment>, watcher::Error>>>,
    fail_creates: bool,
    create_calls: usize,
    created: usize,
}

#[derive(Clone, Default)]
pub struct FakeClient(Arc<Mutex<State>>);

impl FakeClient {
    /// Returns the sending side of the stream handed out by `watch_deployments`
    pub fn watch(&self) -> WatchEvents {
        let (tx, rx) = mpsc::unbounded();
        self.0.lock().unwrap().watch = Some(rx);
        tx
    }

    pub fn fail_creates(&self, fail: bool) {
        self.0.lock().unwrap().fail_creates = fail;
    }

    pub fn insert_service(&self, svc: Service) {
        self.0.lock().unwrap().services.insert(id(&svc), svc);
    }

    pub fn service(&self, ns: &str, name: &str) -> Option<Service> {
        let key = (ns.to_string(), name.to_string());
        self.0.lock().unwrap().services.get(&key).cloned()
    }

    pub fn ingress(&self, ns: &str, name: &str) -> Option<Ingress> {
        let key = (ns.to_string(), name.to_string());
        self.0.lock().unwrap().ingresses.get(&key).cloned()
    }

    /// Create calls made, successful or not
    pub fn create_calls(&self) -> usize {
        self.0.lock().unwrap().create_calls
    }

    /// Objects actually created
    pub fn created(&self) -> usize {
        self.0.lock().unwrap().created
    }

    fn create<K: ResourceExt + Clone>(
        &self,
        obj: &K,
        objects: impl Fn(&mut State) -> &mut BTreeMap<(String, String), K>,
    ) -> Result<K, ClientError> {
        let mut state = self.0.lock().unwrap();
        state.create_calls += 1;
        if state.fail_creates {
            return Err(ClientError::Kube(kube::Error::Service("apiserver unavailable".into())));
        }
        if obj.namespace().is_none() {
            return Err(ClientError::MissingNamespace);
        }
        let id = id(obj);
        if objects(&mut *state).contains_key(&id) {
            return Err(ClientError::AlreadyExists);
        }
        objects(&mut *state).insert(id, obj.clone());
        state.created += 1;
        Ok(obj.clone())
    }
}

fn id<K: ResourceExt>(obj: &K) -> (String, String) {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

#[async_trait]
impl ClusterClient for FakeClient {
    fn watch_deployments(&self) -> BoxStream<'static, Result<watcher::Event<Deployment>, watcher::Error>> {
        match self.0.lock().unwrap().watch.take() {
            Some(rx) => rx.boxed(),
            None => stream::pending().boxed(),
        }
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, ClientError> {
        Ok(self.service(namespace, name))
    }

    async fn create_service(&self, service: &Service) -> Result<Service, ClientError> {
        self.create(service, |state| &mut state.services)
    }

    async fn create_ingress(&self, ingress: &Ingress) -> Result<Ingress, ClientError> {
        self.create(ingress, |state| &mut state.ingresses)
    }
}
