//! Layerstore Core — Layered Concurrent Maps and Tables
//!
//! Generic in-process key-value containers in two shapes:
//!
//! - [`Map`]: key → value
//! - [`Table`]: key1 → key2 → value
//!
//! # Shadow copies
//!
//! Any container can produce a shadow copy: a new, empty container that
//! falls through to the original ("shadow") for every key it has not
//! written itself. Writes land in the copy only; the shadow is never
//! mutated through it. Copies of copies form chains of any depth.
//!
//! # Concurrency
//!
//! - Every container owns one RwLock guarding its own local entries
//! - Reads release that lock before asking the shadow
//! - Writes hold it for the whole operation, shadow lookups included
//! - Locks are only ever taken toward the root, so chains cannot deadlock
//!
//! # Example
//!
//! ```
//! use layerstore_core::{Map, StoreError};
//!
//! let root = Map::new();
//! root.set("a", 1).unwrap();
//!
//! let child = root.shadow_copy();
//! child.set("b", 2).unwrap();
//! assert_eq!(child.get("a"), Ok(1));
//! assert_eq!(child.delete("a"), Err(StoreError::CannotDeleteFromShadow));
//! assert!(!root.contains("b"));
//! ```

pub mod config;
pub mod error;
pub mod map;
pub mod table;

// Re-export key types for convenience
pub use config::Config;
pub use error::{StoreError, StoreResult};
pub use map::Map;
pub use table::Table;

// Flattened views are returned as hashbrown maps
pub use hashbrown;
