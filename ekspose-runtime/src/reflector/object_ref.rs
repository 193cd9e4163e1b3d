use kube::{Resource, ResourceExt};
use std::fmt::{self, Display};

/// A namespaced (if relevant) reference to a watched object
///
/// This is the unit of work handed to the [`WorkQueue`](crate::WorkQueue). It is built
/// from the observed object as soon as an event arrives, so the queue never holds on to
/// (possibly stale) object bodies.
///
/// ```
/// use ekspose_runtime::reflector::ObjectKey;
/// let key = ObjectKey::new("web").within("default");
/// assert_eq!(key.to_string(), "default/web");
/// assert_eq!(ObjectKey::new("node-1").to_string(), "node-1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// The namespace of the object
    ///
    /// `None` for cluster-scoped objects.
    pub namespace: Option<String>,
    /// The name of the object
    pub name: String,
}

impl ObjectKey {
    /// A cluster-scoped key, use [`ObjectKey::within`] to scope it to a namespace
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            namespace: None,
            name: name.to_string(),
        }
    }

    /// Scope the key to `namespace`
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Creates an `ObjectKey` from the object's metadata
    ///
    /// Returns `None` if the object has no name, since such an object can never be looked up again.
    #[must_use]
    pub fn from_obj<K: Resource>(obj: &K) -> Option<Self> {
        let name = obj.meta().name.clone().filter(|name| !name.is_empty())?;
        Some(Self {
            namespace: obj.namespace(),
            name,
        })
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ObjectKey;
    use k8s_openapi::api::{apps::v1::Deployment, core::v1::Node};
    use kube::api::ObjectMeta;

    #[test]
    fn from_obj_should_keep_namespace() {
        let deploy = Deployment {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                ..ObjectMeta::default()
            },
            ..Deployment::default()
        };
        assert_eq!(
            ObjectKey::from_obj(&deploy),
            Some(ObjectKey::new("web").within("default"))
        );
    }

    #[test]
    fn from_obj_should_reject_nameless_objects() {
        assert_eq!(ObjectKey::from_obj(&Node::default()), None);
        let node = Node {
            metadata: ObjectMeta {
                name: Some(String::new()),
                ..ObjectMeta::default()
            },
            ..Node::default()
        };
        assert_eq!(ObjectKey::from_obj(&node), None);
    }

    #[test]
    fn namespaced_and_cluster_keys_should_differ() {
        assert_ne!(ObjectKey::new("foo"), ObjectKey::new("foo").within("bar"));
        assert_eq!(ObjectKey::new("foo").within("bar").to_string(), "bar/foo");
    }
}
