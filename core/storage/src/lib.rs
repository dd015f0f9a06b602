//! Storage abstractions for Ledgersync.
//!
//! This module provides the remote document store interface with its
//! backends (in-memory, filesystem, HTTP), a registry for resolving a
//! backend from configuration, live queries, and the key-value backends
//! the local cache persists into.
//!
//! # Design Principles
//! - Backend isolation: No backend-specific logic in the sync coordinator
//! - Async operations: All I/O operations are async
//! - No hidden retries: backends report failures, callers decide policy
//! - Unified error semantics: Consistent error types across backends

pub mod http;
pub mod kv;
pub mod local;
pub mod memory;
pub mod provider;
pub mod query;
pub mod registry;

pub use http::RestRemote;
pub use kv::{FileKv, KeyValueStore, MemoryKv};
pub use local::FsRemote;
pub use memory::MemoryRemote;
pub use provider::{Document, Fields, RemoteStore, SnapshotStream};
pub use query::{Direction, Filter, OrderBy, Query};
pub use registry::{create_default_registry, RemoteFactory, RemoteRegistry};
