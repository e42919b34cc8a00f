//! Distributed, monotonically increasing unique IDs, organized by *domain*.
//!
//! Each process keeps an in-memory segment of pre-reserved IDs per domain and
//! dispenses them locally at near-zero cost. When a segment runs low, a fresh,
//! disjoint segment is leased from a shared backing store, so concurrent
//! processes never hand out overlapping IDs for the same domain. Segment sizes
//! adapt to demand: leases grow while a segment drains faster than the
//! configured target duration and shrink when demand falls off.
//!
//! IDs are strictly increasing per domain, never repeat, and may contain gaps
//! (a crashed process forfeits the unused remainder of its segment).
//!
//! # Example
//!
//! ```
//! use segid::{Builder, Config, Deadline, MemoryLeaseStore};
//!
//! let builder = Builder::new(MemoryLeaseStore::new(), Config::default());
//! builder.prepare(Deadline::none())?;
//!
//! let players = builder.build("player")?;
//! let id = players.next()?;
//! assert_eq!(id, 30_000_001); // default creation offset + 1
//! # Ok::<(), segid::Error>(())
//! ```
mod builder;
mod config;
mod engine;
mod error;
mod stats;
mod store;

pub use crate::builder::*;
pub use crate::config::*;
pub use crate::engine::*;
pub use crate::error::*;
pub use crate::stats::*;
pub use crate::store::*;
