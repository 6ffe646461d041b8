//! Blocks the commit pipeline inserts on its own: domain adapters and
//! network bridges.

pub mod copier;
pub mod network;

pub use copier::Copier;
pub use network::{NetworkSink, NetworkSource};
