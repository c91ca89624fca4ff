//! The upload engine: protocol state machine plus its pluggable backends.

pub mod bootstrap;
pub mod checksum;
pub mod events;
pub mod lock;
pub mod processor;
pub mod storage;
pub mod stream;
pub mod tracker;

pub use processor::TusProcessor;
