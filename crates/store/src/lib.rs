//! Content-addressed on-disk object store shared by all sandboxed builds.
//!
//! The store keeps two kinds of files in a single flat directory:
//! - `o-<hex objectID>`: cached bodies, named by their object id
//! - `a-<hex actionID>`: small JSON index records pointing at an object
//!
//! Writes are crash-safe: bodies and index records are written to a temp
//! file in the store directory and renamed into place, and an index record
//! is only published after the object it references exists in full.
//! Eviction is by last-access time; builds that still hold hardlinks to an
//! object keep its bytes alive after the store entry is unlinked.

mod disk;
mod error;

pub use disk::{DiskStore, IndexEntry, StoreHit};
pub use error::{Error, Result};
