//! Exposes every Deployment of a cluster through a Service and an Ingress
//!
//! For each Deployment `ns/name` the controller makes sure that
//! - a Service `ns/name` exists, selecting the pod template labels on port 80
//! - an Ingress `ns/name` exists, routing `/name` to that Service
//!
//! Existing objects are never modified, and nothing is deleted when a Deployment goes away.
//!
//! ```no_run
//! use ekspose::client::KubeClient;
//!
//! # async fn wrapper() -> Result<(), kube::Error> {
//! let client = KubeClient::new(kube::Client::try_default().await?);
//! let shutdown = async {
//!     tokio::signal::ctrl_c().await.ok();
//! };
//! ekspose::run(client, ekspose_runtime::Config::default(), shutdown).await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod reconcile;

#[cfg(test)]
mod fake;

use client::ClusterClient;
use ekspose_runtime::{Config, Controller};
use reconcile::{error_policy, reconcile, Context};
use std::{future::Future, sync::Arc};

/// Run the controller against `client` until `shutdown` resolves
pub async fn run<C: ClusterClient>(client: C, config: Config, shutdown: impl Future<Output = ()>) {
    let controller = Controller::new(client.watch_deployments(), config);
    let ctx = Arc::new(Context {
        store: controller.store(),
        client,
    });
    controller.run(reconcile, error_policy, ctx, shutdown).await;
}
