//! weir-framework: an in-process dataflow runtime.
//!
//! Users implement [`Block`], wire blocks into a [`Topology`], and call
//! `commit()`. The runtime schedules each block's work function when input
//! data and output space are available, and moves produced buffers to
//! downstream consumers by reference.

#![deny(clippy::wildcard_imports)]

pub mod arg;
pub mod block;
pub mod blocks;
pub mod buffer;
pub mod dtype;
pub mod error;
pub mod handle;
pub mod label;
pub mod port;
pub mod registry;
pub mod topology;
pub(crate) mod worker_actor;

pub use arg::Arg;
pub use block::{Block, BufferMode, PropagateOutputs, WorkContext, WorkInfo};
pub use buffer::{BufferChunk, BufferManager, SharedBuffer};
pub use dtype::{DType, ElemKind};
pub use error::Error;
pub use handle::{BlockBuilder, BlockHandle, PortInfo, PortName, WorkStats};
pub use label::Label;
pub use port::{InputPort, OutputPort};
pub use topology::{Connector, Endpoint, Flow, Topology};

#[cfg(test)]
mod tests;
