use crate::{
    reflector::{ObjectKey, Writer},
    WorkQueue,
};
use futures::{Stream, StreamExt};
use kube::{runtime::watcher, Resource};
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Feeds watch events into the cache and the keys of changed objects into the queue
///
/// Runs until the watch stream ends or `stop` is cancelled. Never calls the reconciler.
pub(crate) async fn run<K, S>(
    stream: S,
    mut writer: Writer<K>,
    queue: WorkQueue<ObjectKey>,
    stop: CancellationToken,
)
where
    K: Resource + Clone,
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>>,
{
    let reader = writer.as_reader();
    let mut stream = std::pin::pin!(stream);
    loop {
        let event = tokio::select! {
            () = stop.cancelled() => break,
            event = stream.next() => event,
        };
        match event {
            Some(Ok(event)) => {
                for key in apply(&mut writer, &reader, &event) {
                    debug!(%key, "event received");
                    queue.enqueue(key);
                }
            }
            // The watcher backs off and reconnects on its own
            Some(Err(err)) => warn!(error = %err, "watch stream failed"),
            None => {
                debug!("watch stream ended");
                break;
            }
        }
    }
}

/// Applies `event` to the cache and returns the keys that need to be reconciled
///
/// Updates are not distinguished from adds: both mean the object may have drifted from
/// its desired state. Objects listed during a relist are only queued once the relist is
/// complete, since they are not visible in the cache before that. Objects that disappeared
/// during the relist are queued as well, as their deletion was never observed.
fn apply<K>(
    writer: &mut Writer<K>,
    reader: &crate::Store<K>,
    event: &watcher::Event<K>,
) -> Vec<ObjectKey>
where
    K: Resource + Clone,
{
    let keys = match event {
        watcher::Event::Apply(obj) | watcher::Event::Delete(obj) => match ObjectKey::from_obj(obj) {
            Some(key) => vec![key],
            None => {
                warn!("ignoring watch event for object without a name");
                Vec::new()
            }
        },
        watcher::Event::Init | watcher::Event::InitApply(_) => Vec::new(),
        watcher::Event::InitDone => {
            let mut keys = reader.keys().into_iter().collect::<BTreeSet<_>>();
            writer.apply_watcher_event(event);
            keys.extend(reader.keys());
            return keys.into_iter().collect();
        }
    };
    writer.apply_watcher_event(event);
    keys
}

#[cfg(test)]
mod tests {
    use super::apply;
    use crate::reflector::{store, ObjectKey};
    use k8s_openapi::api::apps::v1::Deployment;
    use kube::{api::ObjectMeta, runtime::watcher::Event};

    fn deploy(name: &str) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..ObjectMeta::default()
            },
            ..Deployment::default()
        }
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new(name).within("default")
    }

    #[test]
    fn apply_and_delete_should_yield_their_key() {
        let (reader, mut writer) = store();
        assert_eq!(apply(&mut writer, &reader, &Event::Apply(deploy("web"))), vec![key("web")]);
        assert!(reader.get(&key("web")).is_some());
        assert_eq!(apply(&mut writer, &reader, &Event::Delete(deploy("web"))), vec![key("web")]);
        assert!(reader.get(&key("web")).is_none());
    }

    #[test]
    fn nameless_objects_should_be_skipped() {
        let (reader, mut writer) = store();
        assert!(apply(&mut writer, &reader, &Event::Apply(Deployment::default())).is_empty());
        assert!(reader.is_empty());
    }

    #[test]
    fn relist_should_yield_listed_and_vanished_keys_on_init_done() {
        let (reader, mut writer) = store();
        apply(&mut writer, &reader, &Event::Apply(deploy("gone")));
        apply(&mut writer, &reader, &Event::Apply(deploy("kept")));

        assert!(apply(&mut writer, &reader, &Event::Init).is_empty());
        assert!(apply(&mut writer, &reader, &Event::InitApply(deploy("kept"))).is_empty());
        assert!(apply(&mut writer, &reader, &Event::InitApply(deploy("new"))).is_empty());
        assert_eq!(apply(&mut writer, &reader, &Event::InitDone), vec![
            key("gone"),
            key("kept"),
            key("new")
        ]);
        assert!(reader.get(&key("gone")).is_none());
    }
}
