//! Caches watched objects in memory

mod object_ref;
pub mod store;

pub use self::object_ref::ObjectKey;
pub use store::{store, Store, Writer};
