//! Real-time link emulator.
//!
//! Sits between pairs of Ethernet ports and forwards frames across an
//! emulated link with configurable loss, duplication, one-way delay and a
//! bandwidth cap. Every stage of the pipeline runs on its own core and talks
//! to its neighbours through bounded single-producer/single-consumer queues.

#[cfg(test)]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod clock;
pub mod config;
pub mod error;
pub mod impairment;
pub mod link;
pub mod packet;
pub mod pipeline;
pub mod port;
pub mod rate_limiter;
pub mod ring;
pub mod runtime;
pub mod stage;
pub mod stats;
pub mod token_bucket;

pub use config::{Cli, EmulatorConfig, LinkSpec};
pub use error::RuntimeError;
pub use pipeline::Pipeline;
pub use runtime::Emulator;
