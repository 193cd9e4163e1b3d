use super::Retry;
use crate::{reflector::ObjectKey, workqueue::Requeue, WorkQueue};
use std::{future::Future, sync::Arc};
use tracing::{debug, error, info, warn};

/// What happened to a key handed to a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Reconciled,
    /// Failed, and the error policy ruled out retrying
    NotRetriable,
    /// Failed, and went through the backoff policy of the queue
    Requeued(Requeue),
}

/// Drains `queue` until it is shut down, reconciling one key at a time
pub(crate) async fn run<Ctx, ReconcilerFut, E>(
    id: usize,
    queue: WorkQueue<ObjectKey>,
    reconciler: Arc<impl Fn(ObjectKey, Arc<Ctx>) -> ReconcilerFut>,
    error_policy: Arc<impl Fn(&ObjectKey, &E, Arc<Ctx>) -> Retry>,
    context: Arc<Ctx>,
) where
    ReconcilerFut: Future<Output = Result<(), E>>,
    E: std::error::Error,
{
    debug!(worker = id, "worker started");
    while let Some(key) = queue.dequeue().await {
        let outcome = process(&queue, &key, reconciler.as_ref(), error_policy.as_ref(), &context).await;
        debug!(%key, ?outcome, "processed");
        queue.done(&key);
    }
    debug!(worker = id, "worker stopped");
}

async fn process<Ctx, ReconcilerFut, E>(
    queue: &WorkQueue<ObjectKey>,
    key: &ObjectKey,
    reconciler: &impl Fn(ObjectKey, Arc<Ctx>) -> ReconcilerFut,
    error_policy: &impl Fn(&ObjectKey, &E, Arc<Ctx>) -> Retry,
    context: &Arc<Ctx>,
) -> Outcome
where
    ReconcilerFut: Future<Output = Result<(), E>>,
    E: std::error::Error,
{
    debug!(%key, "reconcile started");
    let err = match reconciler(key.clone(), context.clone()).await {
        Ok(()) => {
            info!(%key, "reconciled");
            queue.forget(key);
            return Outcome::Reconciled;
        }
        Err(err) => err,
    };
    if error_policy(key, &err, context.clone()) == Retry::Never {
        error!(%key, error = %err, "dropping key, failure is not retriable");
        queue.forget(key);
        return Outcome::NotRetriable;
    }
    let requeue = queue.requeue_with_backoff(key.clone());
    match requeue {
        Requeue::After(delay) => {
            warn!(%key, error = %err, ?delay, "reconcile failed, retry scheduled");
        }
        Requeue::Exhausted { retries } => {
            error!(%key, error = %err, retries, "dropping key after exhausting retries");
            queue.forget(key);
        }
        Requeue::Discarded => {
            warn!(%key, error = %err, "reconcile failed, not retried since the queue is shutting down");
            queue.forget(key);
        }
    }
    Outcome::Requeued(requeue)
}
