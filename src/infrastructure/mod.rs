//! Infrastructure layer implementations.
//!
//! This module contains concrete implementations of the ports defined in the
//! domain layer: storage backends and the sandbox payment gateway.

pub mod gateway;
pub mod in_memory;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
