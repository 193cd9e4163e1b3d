//! Converges the Service and Ingress of a Deployment
use crate::client::{ClientError, ClusterClient};
use ekspose_runtime::{ObjectKey, Retry, Store};
use k8s_openapi::{
    api::{
        apps::v1::Deployment,
        core::v1::{Service, ServicePort, ServiceSpec},
        networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
            IngressServiceBackend, IngressSpec, ServiceBackendPort,
        },
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::ResourceExt;
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;
use tracing::{debug, info};

/// Port exposed by every Service, and targeted by every Ingress
pub const HTTP_PORT: i32 = 80;

/// Annotation telling the ingress controller to strip the matched path prefix
pub const REWRITE_TARGET_ANNOTATION: &str = "nginx.ingress.kubernetes.io/rewrite-target";

/// Failure to converge a Deployment
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("malformed key {0}: expected namespace/name")]
    MalformedKey(ObjectKey),
    #[error("failed to create Service {key}: {source}")]
    CreateService {
        key: ObjectKey,
        #[source]
        source: ClientError,
    },
    #[error("failed to get existing Service {key}: {source}")]
    GetService {
        key: ObjectKey,
        #[source]
        source: ClientError,
    },
    #[error("Service {0} reported as existing but not found")]
    ServiceVanished(ObjectKey),
    #[error("failed to create Ingress {key}: {source}")]
    CreateIngress {
        key: ObjectKey,
        #[source]
        source: ClientError,
    },
}

/// State shared by every reconciliation
pub struct Context<C> {
    /// Cluster access
    pub client: C,
    /// Cache of watched Deployments
    pub store: Store<Deployment>,
}

/// Service selecting the pods of `deploy` on port 80
///
/// The selector is copied verbatim from the pod template labels, an empty label set gives
/// an empty selector.
#[must_use]
pub fn desired_service(deploy: &Deployment) -> Service {
    let selector = deploy
        .spec
        .as_ref()
        .and_then(|spec| spec.template.metadata.as_ref())
        .and_then(|meta| meta.labels.clone())
        .unwrap_or_default();
    Service {
        metadata: ObjectMeta {
            name: Some(deploy.name_any()),
            namespace: deploy.namespace(),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: HTTP_PORT,
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

/// Ingress routing `/<service name>` to port 80 of `svc`
#[must_use]
pub fn desired_ingress(svc: &Service) -> Ingress {
    let name = svc.name_any();
    Ingress {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: svc.namespace(),
            annotations: Some(BTreeMap::from([(
                REWRITE_TARGET_ANNOTATION.to_string(),
                "/".to_string(),
            )])),
            ..ObjectMeta::default()
        },
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(format!("/{name}")),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name,
                                port: Some(ServiceBackendPort {
                                    number: Some(HTTP_PORT),
                                    ..ServiceBackendPort::default()
                                }),
                            }),
                            ..IngressBackend::default()
                        },
                    }],
                }),
                ..IngressRule::default()
            }]),
            ..IngressSpec::default()
        }),
        ..Ingress::default()
    }
}

/// Makes sure the Deployment behind `key` has its Service and Ingress
///
/// Only ever creates: objects that already exist are left untouched, and nothing is
/// cleaned up once the Deployment is gone.
pub async fn reconcile<C: ClusterClient>(key: ObjectKey, ctx: Arc<Context<C>>) -> Result<(), Error> {
    let Some(ns) = key.namespace.as_deref() else {
        return Err(Error::MalformedKey(key));
    };
    if key.name.is_empty() {
        return Err(Error::MalformedKey(key));
    }
    let Some(deploy) = ctx.store.get(&key) else {
        debug!(%key, "deployment no longer exists");
        return Ok(());
    };

    let svc = match ctx.client.create_service(&desired_service(&deploy)).await {
        Ok(svc) => {
            info!(%key, "created service");
            svc
        }
        Err(ClientError::AlreadyExists) => ctx
            .client
            .get_service(ns, &key.name)
            .await
            .map_err(|source| Error::GetService {
                key: key.clone(),
                source,
            })?
            .ok_or_else(|| Error::ServiceVanished(key.clone()))?,
        Err(source) => return Err(Error::CreateService { key, source }),
    };

    match ctx.client.create_ingress(&desired_ingress(&svc)).await {
        Ok(_) => info!(%key, "created ingress"),
        Err(ClientError::AlreadyExists) => debug!(%key, "ingress already exists"),
        Err(source) => return Err(Error::CreateIngress { key, source }),
    }
    Ok(())
}

/// Malformed keys can never succeed, everything else is worth retrying
pub fn error_policy<C>(_key: &ObjectKey, err: &Error, _ctx: Arc<Context<C>>) -> Retry {
    match err {
        Error::MalformedKey(_) => Retry::Never,
        _ => Retry::WithBackoff,
    }
}
