//! Cascading-deletion garbage collector.
//!
//! Monitors feed object changes to the propagator, which keeps the
//! owner/dependent graph; dirty-queue workers delete objects whose owners
//! are gone and orphan-queue workers detach dependents from owners deleted
//! with the `orphan` finalizer.

pub mod cache;
pub mod collector;
pub mod config;
pub mod error;
pub mod graph;
pub mod memstore;
pub mod metrics;
pub mod models;
pub mod monitor;
pub mod operations;
pub mod propagator;
pub mod resolver;
pub mod store;
pub mod with_xline;
pub mod workqueue;

pub use collector::GarbageCollector;
pub use config::{Config, GcConfig, XlineConfig, load_config};
pub use error::{GcError, ResolveError, StoreError};
pub use memstore::MemoryStore;
pub use models::{Event, EventType, Object, ObjectReference, OwnerReference, PropagationPolicy, Uid};
pub use resolver::{ResourceResolver, ResourceType, StaticResolver};
pub use store::ObjectStore;
pub use with_xline::XlineStore;
