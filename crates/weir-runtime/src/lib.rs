//! Execution substrate shared by the weir crates: the actor exclusion
//! primitive, control-reply wait handles, the worker thread pool, and
//! per-thread scheduling configuration.

pub mod actor_interface;
pub mod thread_config;
pub mod thread_pool;
pub mod wait;
