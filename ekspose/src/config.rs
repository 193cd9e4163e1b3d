//! Command line configuration
use crate::client::KubeClient;
use anyhow::Context as _;
use clap::Parser;
use ekspose_runtime::{BackoffPolicy, Config};
use kube::config::{KubeConfigOptions, Kubeconfig};
use std::{path::PathBuf, time::Duration};

/// Exposes every Deployment through a Service and an Ingress
#[derive(Debug, Clone, Parser)]
#[command(name = "ekspose", version, about)]
pub struct Args {
    /// Path to a kubeconfig file, inferred from the environment when unset
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use instead of the current one
    #[arg(long)]
    pub context: Option<String>,

    /// Only watch Deployments in this namespace
    #[arg(long, short)]
    pub namespace: Option<String>,

    /// Number of concurrent workers
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    /// Delay before the first retry of a failing Deployment, in milliseconds
    #[arg(long, default_value_t = 5)]
    pub backoff_base_ms: u64,

    /// Growth factor of the retry delay, must be above 1
    #[arg(long, default_value_t = 2.0, value_parser = parse_factor)]
    pub backoff_factor: f32,

    /// Upper bound of a single retry delay, in seconds
    #[arg(long, default_value_t = 1000)]
    pub backoff_max_secs: u64,

    /// Retries before a failing Deployment is given up on
    #[arg(long, default_value_t = 15)]
    pub max_retries: usize,

    /// How long to wait for the initial list of Deployments, in seconds
    #[arg(long, default_value_t = 30)]
    pub sync_timeout_secs: u64,

    /// Deadline of every get and create request, in seconds
    #[arg(long, default_value_t = 10)]
    pub request_timeout_secs: u64,
}

/// Retry delays must strictly increase
fn parse_factor(value: &str) -> Result<f32, String> {
    let factor = value.parse::<f32>().map_err(|err| err.to_string())?;
    if factor.is_finite() && factor > 1.0 {
        Ok(factor)
    } else {
        Err(format!("{value} is not a finite number above 1"))
    }
}

impl Args {
    /// Controller tunables derived from the arguments
    #[must_use]
    pub fn controller_config(&self) -> Config {
        Config::default()
            .workers(self.workers)
            .backoff(BackoffPolicy {
                base_delay: Duration::from_millis(self.backoff_base_ms),
                factor: self.backoff_factor,
                max_delay: Duration::from_secs(self.backoff_max_secs),
                max_retries: self.max_retries,
            })
            .sync_timeout(Duration::from_secs(self.sync_timeout_secs))
    }

    /// Load cluster credentials and build a client
    ///
    /// Credentials come from `--kubeconfig` when given, otherwise from the environment
    /// (`KUBECONFIG`, `~/.kube/config` or the in-cluster service account).
    pub async fn client(&self) -> anyhow::Result<KubeClient> {
        let options = KubeConfigOptions {
            context: self.context.clone(),
            ..KubeConfigOptions::default()
        };
        let config = match (&self.kubeconfig, &self.context) {
            (Some(path), _) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .context("failed to load kubeconfig")?
            }
            (None, Some(_)) => kube::Config::from_kubeconfig(&options)
                .await
                .context("failed to load kubeconfig")?,
            (None, None) => kube::Config::infer()
                .await
                .context("failed to infer cluster configuration")?,
        };
        let client = kube::Client::try_from(config).context("failed to create client")?;

        let client = KubeClient::new(client).request_timeout(Duration::from_secs(self.request_timeout_secs));
        Ok(match &self.namespace {
            Some(ns) => client.within(ns),
            None => client,
        })
    }
}
