//! Domain adapter inserted by commit when the two sides of a flow cannot
//! share buffers. Copies bytes from upstream storage into buffers from its
//! own pool, which lives in the downstream-compatible domain.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::block::{Block, WorkContext};
use crate::dtype::DType;
use crate::error::Error;
use crate::handle::{BlockBuilder, BlockHandle};

pub struct Copier;

impl Block for Copier {
    fn work(&mut self, io: &mut WorkContext<'_>) -> Result<(), Error> {
        let (input, output) = io.stream_pair(0, 0)?;
        let elem = input.dtype().size().max(1);

        let out_buffer = output.buffer_mut();
        let bytes = input.buffer().len().min(out_buffer.len()) / elem * elem;
        if bytes == 0 {
            return Ok(());
        }
        out_buffer[..bytes].copy_from_slice(&input.buffer()[..bytes]);
        output.produce(bytes / elem);
        input.consume(bytes / elem);
        Ok(())
    }
}

/// A copier block adapting `dtype` streams, living in `env_id`.
pub(crate) fn make_copier(dtype: DType, env_id: u64) -> BlockHandle {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    BlockBuilder::new(format!("copier{n}"), Copier)
        .input(0usize, dtype, "")
        .output(0usize, dtype, "")
        .environment(env_id)
        .build()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::Copier;
    use crate::block::{Block, WorkContext, WorkInfo};
    use crate::buffer::chunk::BufferChunk;
    use crate::buffer::manager::{BufferManagerArgs, GenericBufferManager};
    use crate::dtype::{DType, ElemKind};
    use crate::port::inbox::InputInbox;
    use crate::port::input::InputPort;
    use crate::port::output::OutputPort;

    #[test]
    fn copier_moves_whole_elements_across() {
        let dtype = DType::new(ElemKind::I32);
        let mut inputs = BTreeMap::new();
        let mut input = InputPort::new("0".to_string(), dtype, String::new(), InputInbox::new());
        input
            .inbox()
            .push_chunk(BufferChunk::from_slice(&[1u8; 12], dtype));
        input.drain_inbox();
        inputs.insert("0".to_string(), input);

        let mut outputs = BTreeMap::new();
        let mut output = OutputPort::new("0".to_string(), dtype, String::new());
        output.set_manager(
            GenericBufferManager::new(BufferManagerArgs {
                num_buffers: 1,
                buffer_size: 64,
            }),
            std::sync::Arc::new(|| {}),
        );
        outputs.insert("0".to_string(), output);

        let mut yield_requested = false;
        let mut io = WorkContext {
            inputs: &mut inputs,
            outputs: &mut outputs,
            info: WorkInfo::default(),
            yield_requested: &mut yield_requested,
        };
        Copier.work(&mut io).expect("copier work");

        let (consumed, _labels) = inputs.get_mut("0").expect("input").finish_work();
        assert_eq!(consumed, 3);
        let produced = outputs.get_mut("0").expect("output").flush();
        assert_eq!(produced, 3);
    }
}
