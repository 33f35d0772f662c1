//! # lsmstore
//!
//! An embeddable log-structured merge-tree key-value engine with:
//! - Write-Ahead Logging (WAL) for durability
//! - Immutable sorted segments with crash-safe publication
//! - Crash recovery of interrupted flushes and compactions
//! - Single-writer/multi-reader concurrency model
//! - Inline or background compaction
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          LsmTree                             │
//! │            (Single Writer / Multi Reader)                    │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │     WAL     │          │  MemTables  │
//!   │  (Append)   │          │  (active +  │
//!   └─────────────┘          │   frozen)   │
//!                            └──────┬──────┘
//!                                   │ flush
//!                                   ▼
//!                           ┌─────────────┐      ┌─────────────┐
//!                           │  Segments   │◄────►│  Compactor  │
//!                           │(newest first)│      │ (k-way merge)│
//!                           └─────────────┘      └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use lsmstore::{Config, LsmTree};
//!
//! # fn main() -> lsmstore::Result<()> {
//! let config = Config::builder().data_dir("/tmp/lsm-demo").build();
//! let tree: LsmTree<u64> = LsmTree::open(config)?;
//!
//! tree.insert(7, b"seven")?;
//! assert_eq!(tree.find(&7)?, Some(b"seven".to_vec()));
//!
//! for record in tree.scan(0..100)? {
//!     let (key, value) = record?;
//!     println!("{key} => {} bytes", value.len());
//! }
//! tree.close()?;
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod codec;
pub mod config;
pub mod error;
pub mod range;

pub mod memtable;
pub mod merge;
pub mod storage;
pub mod tree;
pub mod wal;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use codec::{Codec, Key};
pub use config::{CompactionStrategy, Config, ConfigBuilder, WalSyncStrategy};
pub use error::{LsmError, Result};
pub use memtable::Entry;
pub use storage::CompactionStats;
pub use tree::{LsmTree, TreeScan};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of lsmstore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
