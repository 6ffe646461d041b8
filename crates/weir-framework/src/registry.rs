//! Process-wide block factory registry.
//!
//! Topology descriptions refer to blocks by path; factories registered here
//! turn a path plus an opaque argument list into a running block.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use crate::arg::Arg;
use crate::error::Error;
use crate::handle::BlockHandle;

pub type BlockFactory = Box<dyn Fn(&[Arg]) -> Result<BlockHandle, Error> + Send + Sync>;

fn registry() -> &'static RwLock<HashMap<String, BlockFactory>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, BlockFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a factory under a path like `/blocks/foo`. A later registration
/// under the same path replaces the earlier one.
pub fn register_block<F>(path: impl Into<String>, factory: F)
where
    F: Fn(&[Arg]) -> Result<BlockHandle, Error> + Send + Sync + 'static,
{
    registry()
        .write()
        .expect("block registry poisoned")
        .insert(path.into(), Box::new(factory));
}

pub fn make_block(path: &str, args: &[Arg]) -> Result<BlockHandle, Error> {
    let registry = registry().read().expect("block registry poisoned");
    let factory = registry
        .get(path)
        .ok_or_else(|| Error::DataFormat(format!("no registered block factory for path '{path}'")))?;
    factory(args)
}

#[cfg(test)]
mod tests {
    use super::{make_block, register_block};
    use crate::block::Block;
    use crate::handle::BlockBuilder;

    struct Inert;
    impl Block for Inert {}

    #[test]
    fn registered_factory_is_reachable_by_path() {
        register_block("/test/registry/inert", |_args| {
            Ok(BlockBuilder::new("inert", Inert).build())
        });
        let handle = make_block("/test/registry/inert", &[]).expect("factory should run");
        assert_eq!(handle.name(), "inert");
    }

    #[test]
    fn unknown_path_is_a_data_format_error() {
        let err = make_block("/no/such/path", &[]).expect_err("unknown path");
        assert!(err.to_string().contains("/no/such/path"));
    }
}
