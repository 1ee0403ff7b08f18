//! # rotolog
//!
//! A non-blocking, size-rotating log file writer with explicit page-cache
//! control.
//!
//! Producers hand records to [`Rotation::write`] and are never stalled by
//! disk I/O, rotation or flushing: records go into a lock-free staging
//! ring and a background write loop does the file work. The active file is
//! rotated into a timestamped backup once it reaches the configured size,
//! a bounded number of backups is retained, and the kernel is periodically
//! advised to flush recently written pages and to drop cold log pages from
//! the page cache so log data does not displace the hot working set.
//!
//! ## Trade-offs, by design
//!
//! - **No durability barrier**: flushing is an advisory hint, not fsync.
//! - **No backpressure**: when producers outrun the write loop, the oldest
//!   staged records are overwritten instead of anyone blocking.
//! - **No cross-producer ordering**: only records from a single producer
//!   are written in publish order.
//!
//! ## Example
//!
//! ```rust,no_run
//! use rotolog::{Config, Rotation};
//!
//! # fn main() -> Result<(), rotolog::Error> {
//! let rotation = Rotation::new(&Config {
//!     max_size_mb: 64,
//!     max_backups: 4,
//!     ..Config::new("/var/log/app/a.log")
//! })?;
//!
//! rotation.write(b"hello\n");
//! rotation.sync()?;
//! rotation.close()?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Backup retention (min-heap by timestamp) and backup file naming.
pub mod backup;

/// Size-bounded write buffer with sticky-error semantics.
pub mod buffer;

/// Configuration envelope and normalisation rules.
pub mod config;

/// Error types.
pub mod error;

/// Filesystem provider traits, OS implementation and kernel hints.
pub mod fs;

/// Active output file management and rotation.
pub mod output;

/// The rotating writer and its background loops.
pub mod rotation;

/// Lock-free staging channel between producers and the write loop.
pub mod staging;

// Re-export key types
pub use config::Config;
pub use error::{Error, Result};
pub use rotation::Rotation;
