//! Read/write client adapters over both queue flavors.
//!
//! The worker consumes one [ReadClient](crate::ReadClient) contract; these
//! adapters bind it to either the durable buffer (acknowledging batches on
//! close) or the in-memory batch queue (nothing to acknowledge). Both apply
//! a poll interval to reads so the worker regains control between batches:
//! a timed-out read is a legitimate "no batch" outcome that lets shutdown
//! signals be observed.

mod acked;
mod memory;

pub use acked::AckedReadClient;
pub use memory::{MemoryReadClient, MemoryWriteClient};
