//! # Wait-free SPMC latest-value exchange
//!
//! A **single-producer / bounded-multi-consumer** exchange for a value of
//! arbitrary type `T`, designed for real-time systems: one producer thread
//! continuously publishes new versions, up to `max_readers` consumer threads
//! each observe the most recent published version at their own pace.
//!
//! # Features
//!
//! * **Wait-free** publish and observe: no thread ever waits on another
//!   for access to a published value
//! * **Zero allocation** on the publish/observe hot paths after construction
//! * **No copies of `T` across threads**: `max_readers + 2` slots are
//!   pre-allocated and small integer slot indices are exchanged atomically
//! * **Latest-value semantics**: a slow consumer skips intermediate
//!   versions and lands on the newest one
//! * **Cache-friendly** layout (`CachePadded` state cells and slots)
//! * **Scoped handles**: registration and slot release tied to drop
//! * **Dynamic capacity growth**: admit more consumers at runtime without
//!   moving existing slots
//!
//! # Quick Example
//!
//! ```ignore
//! use spmc_exchange::Exchange;
//!
//! let exchange = Exchange::new(2, 0u64)?;
//!
//! let mut writer = exchange.write().unwrap();
//! *writer = 42;
//! writer.publish();
//!
//! let mut reader = exchange.read();
//! if reader.has_update() {
//!     reader.pull_update();
//! }
//! assert_eq!(reader.get(), Some(&42));
//! ```
//!
//! # Design Overview
//!
//! Each slot's state is one atomic cell:
//!
//! ```text
//! cell == -1   WRITING  held by the producer
//! cell ==  0   FREE     claimable by the producer
//! cell ==  K   READING  observed by K consumers
//! ```
//!
//! Guarantees:
//!
//! * Exactly **one slot is WRITING** at any time (transiently none inside a
//!   publish, which only the unique producer observes)
//! * Reader counts over all slots never exceed `max_readers`, so with
//!   `max_readers + 2` slots the producer **always finds a FREE slot**
//! * The **latest pointer** names the most recently published slot;
//!   consumers latch it by raising its reader count and retry if the
//!   producer got there first
//!
//! Typical protocol:
//!
//! 1. Producer fills its WRITING slot in place
//! 2. `publish` marks it FREE, names it latest, and claims a new slot
//! 3. Consumer polls `has_update`, then `pull_update` re-latches
//! 4. Consumer reads the latched slot for as long as it likes; the
//!    producer never reclaims a latched slot
//!
//! Consumers that must block on new data do so by external polling of
//! `has_update`; the exchange itself never blocks and never logs.
//!
//! The index-only engine is exposed as [`Arbiter`] for callers that manage
//! their own storage; [`Exchange`] pairs it with typed slots.

pub mod arbiter;
pub mod exchange;

mod error;
mod table;
mod utils;

pub use arbiter::{Arbiter, Lockout, ReadSlot, WriteSlot};
pub use error::ExchangeError;
pub use exchange::{Exchange, Reader, Writer};
#[cfg(unix)]
pub use utils::mono_time_ns;
pub use utils::Samples;
