//! Database module: view models, SQL repositories and the per-source lock.
//!
//! - `model`: row shapes returned by joins that don't map onto a single entity.
//! - `repo`: SQL-only functions that map rows into entities.
//! - `lock`: lease-based exclusive lock guarding one run per source.
//!
//! External modules should import from `feed_reader::db`; the repository API
//! is re-exported here.

pub mod lock;
pub mod model;
pub mod repo;

pub use lock::{acquire_source_lock, SourceLock};
pub use model::{ExpiredFile, PendingSplit};
pub use repo::*;
