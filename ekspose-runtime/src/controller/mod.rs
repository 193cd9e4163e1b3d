//! Runs a reconciler for every object of a watched kind

use crate::{
    backoff::BackoffPolicy,
    reflector::{store, ObjectKey, Store, Writer},
    WorkQueue,
};
use futures::{future, stream::BoxStream, Stream, StreamExt};
use kube::{runtime::watcher, Resource};
use std::{future::Future, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod event_source;
mod worker;

/// How a failed reconciliation should be handled, decided by the error policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Retry the key with exponential backoff, until the policy gives up
    WithBackoff,
    /// Drop the key, retrying cannot succeed
    Never,
}

/// Tunables of a [`Controller`]
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Number of concurrent workers draining the queue
    pub workers: usize,
    /// Retry policy for failing keys
    pub backoff: BackoffPolicy,
    /// How long to wait for the cache to be populated before starting the workers anyway
    pub sync_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 1,
            backoff: BackoffPolicy::default(),
            sync_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Set the number of workers, at least one worker is always started
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the retry policy
    #[must_use]
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set how long to wait for the initial cache sync
    #[must_use]
    pub fn sync_timeout(mut self, sync_timeout: Duration) -> Self {
        self.sync_timeout = sync_timeout;
        self
    }
}

/// Controller
///
/// A controller is made up of:
/// - 1 event source, feeding a watch stream of `K` into a [`Store`] and the keys of changed
///   objects into a [`WorkQueue`]
/// - N workers taking keys off the queue and calling the user defined `reconciler`
/// - a user defined `error_policy` deciding whether a failed key is retried
///
/// The reconciler only ever receives an [`ObjectKey`]. It is expected to look the object
/// up in the [`Store`] (see [`Controller::store`]) and derive the full desired state from
/// what it finds there, treating a missing object as deleted.
///
/// The same key is never reconciled by two workers at once.
pub struct Controller<K> {
    stream: BoxStream<'static, Result<watcher::Event<K>, watcher::Error>>,
    writer: Writer<K>,
    reader: Store<K>,
    queue: WorkQueue<ObjectKey>,
    config: Config,
}

impl<K> Controller<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    /// Create a Controller fed by a watch stream of `K`
    ///
    /// The stream is usually a [`kube::runtime::watcher()`], and is expected to recover from
    /// errors by itself; errors are only logged.
    pub fn new<S>(stream: S, config: Config) -> Self
    where
        S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send + 'static,
    {
        let (reader, writer) = store();
        Self {
            stream: stream.boxed(),
            writer,
            reader,
            queue: WorkQueue::new(config.backoff),
            config,
        }
    }

    /// Retrieve a copy of the reader before starting the controller
    #[must_use]
    pub fn store(&self) -> Store<K> {
        self.reader.clone()
    }

    /// Retrieve a handle to the work queue before starting the controller
    #[must_use]
    pub fn queue(&self) -> WorkQueue<ObjectKey> {
        self.queue.clone()
    }

    /// Run the controller until `shutdown` resolves
    ///
    /// Waits (up to [`Config::sync_timeout`]) for the cache to be populated before starting
    /// the workers, since a cold cache makes every reconciliation a no-op. Once `shutdown`
    /// resolves the event source is stopped, the queue is shut down, and this returns after
    /// the workers have drained the queue and finished their in-flight keys.
    pub async fn run<Ctx, ReconcilerFut, E>(
        self,
        reconciler: impl Fn(ObjectKey, Arc<Ctx>) -> ReconcilerFut + Send + Sync + 'static,
        error_policy: impl Fn(&ObjectKey, &E, Arc<Ctx>) -> Retry + Send + Sync + 'static,
        context: Arc<Ctx>,
        shutdown: impl Future<Output = ()>,
    ) where
        Ctx: Send + Sync + 'static,
        ReconcilerFut: Future<Output = Result<(), E>> + Send + 'static,
        E: std::error::Error + Send + 'static,
    {
        let Self {
            stream,
            writer,
            reader,
            queue,
            config,
        } = self;
        let stop = CancellationToken::new();
        let source = tokio::spawn(event_source::run(stream, writer, queue.clone(), stop.clone()));

        let mut shutdown = std::pin::pin!(shutdown);
        let stopping = match wait_for_cache_sync(&reader, config.sync_timeout, shutdown.as_mut()).await {
            CacheSync::Synced => {
                info!(objects = reader.len(), "cache synced");
                false
            }
            CacheSync::TimedOut => {
                warn!(timeout = ?config.sync_timeout, "cache not synced, starting workers anyway");
                false
            }
            CacheSync::Stopped => {
                warn!("shutdown requested before the cache synced");
                true
            }
        };

        let reconciler = Arc::new(reconciler);
        let error_policy = Arc::new(error_policy);
        let workers = (0..config.workers.max(1))
            .map(|id| {
                tokio::spawn(worker::run(
                    id,
                    queue.clone(),
                    reconciler.clone(),
                    error_policy.clone(),
                    context.clone(),
                ))
            })
            .collect::<Vec<_>>();
        info!(workers = workers.len(), "controller started");

        if !stopping {
            shutdown.await;
        }
        info!("shutting down controller");
        stop.cancel();
        queue.shutdown();
        for handle in future::join_all(workers).await {
            if let Err(err) = handle {
                warn!(error = %err, "worker task failed");
            }
        }
        if let Err(err) = source.await {
            warn!(error = %err, "event source task failed");
        }
        info!("controller stopped");
    }
}

enum CacheSync {
    Synced,
    TimedOut,
    Stopped,
}

/// Waits for the initial list to land in `store`, bounded by `timeout` and `shutdown`
async fn wait_for_cache_sync<K>(
    store: &Store<K>,
    timeout: Duration,
    shutdown: std::pin::Pin<&mut impl Future<Output = ()>>,
) -> CacheSync {
    tokio::select! {
        () = store.wait_until_ready() => CacheSync::Synced,
        () = tokio::time::sleep(timeout) => CacheSync::TimedOut,
        () = shutdown => CacheSync::Stopped,
    }
}
