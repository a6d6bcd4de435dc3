//! RingMPMC - Bounded Lock-Free Multi-Producer Multi-Consumer FIFO
//!
//! A fixed-capacity ring buffer that any number of tasks may push to and
//! pop from concurrently without locks. Built for publish pipelines that
//! must absorb bursts while a downstream connection is unavailable.
//!
//! # Key Features
//!
//! - Sequence-stamped slots (safe concurrent publication, no ABA)
//! - 128-byte alignment for the hot atomics (prefetcher false sharing)
//! - Linear short-burst backoff on contended CAS (PAUSE, then yield)
//! - [`OverflowBuffer`]: drop-oldest wrapper that reports the evicted item
//!
//! # Example
//!
//! ```
//! use ringmpmc::Ring;
//!
//! let ring = Ring::new(4);
//! assert!(ring.try_push(1u64).is_ok());
//! assert!(ring.try_push(2u64).is_ok());
//! assert_eq!(ring.try_pop(), Some(1));
//! assert_eq!(ring.try_pop(), Some(2));
//! assert_eq!(ring.try_pop(), None);
//! ```

mod backoff;
mod buffer;
mod ring;

pub use backoff::Backoff;
pub use buffer::OverflowBuffer;
pub use ring::Ring;
