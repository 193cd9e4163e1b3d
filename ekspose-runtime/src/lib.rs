//! Runtime components for the ekspose controller
//!
//! This crate contains the building blocks of a level-triggered controller:
//! a cache of watched objects, a deduplicating work queue with per-key exponential
//! backoff, and the workers draining it.
//!
//! Most users should get started with the [`Controller`], which wires all of them together.

#![deny(unsafe_code)]

pub mod backoff;
pub mod controller;
pub mod reflector;
pub mod workqueue;

pub use backoff::BackoffPolicy;
pub use controller::{Config, Controller, Retry};
pub use reflector::{store, ObjectKey, Store};
pub use workqueue::{Requeue, WorkQueue};
