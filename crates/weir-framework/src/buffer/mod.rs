//! Buffers, typed chunks, and the pools that feed output ports.

pub mod chunk;
pub mod convert;
pub mod manager;
pub mod shared;

pub use chunk::BufferChunk;
pub use manager::{
    BufferManager, BufferManagerArgs, CircularBufferManager, FrontChangedFn,
    GenericBufferManager, PassthroughBufferManager,
};
pub use shared::{BufferReclaim, SharedBuffer};
