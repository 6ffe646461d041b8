//! In-process network bridge pair.
//!
//! Commit replaces a flow that crosses an environment boundary with a sink
//! on the source side and a source on the destination side, joined by a
//! channel. Chunks and labels travel through unchanged, so byte equality
//! and label indexes hold across the bridge.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender};

use crate::block::{Block, PropagateOutputs, WorkContext};
use crate::dtype::DType;
use crate::error::Error;
use crate::handle::{BlockBuilder, BlockHandle};
use crate::label::Label;
use crate::port::input::InputPort;

enum BridgeItem {
    Chunk(crate::buffer::chunk::BufferChunk),
    Labels(Vec<Label>),
}

pub struct NetworkSink {
    tx: Sender<BridgeItem>,
    /// Woken whenever something is put on the wire.
    peer: BlockHandle,
}

impl Block for NetworkSink {
    fn work(&mut self, io: &mut WorkContext<'_>) -> Result<(), Error> {
        let input = io.input(0)?;
        let mut sent = false;
        while let Some(chunk) = input.take_front() {
            if self.tx.send(BridgeItem::Chunk(chunk)).is_err() {
                return Err(Error::work("network bridge peer disconnected"));
            }
            sent = true;
        }
        if sent {
            self.peer.shared.interface.flag_external_change();
        }
        Ok(())
    }

    fn propagate_labels(
        &mut self,
        _input: &InputPort,
        labels: &[Label],
        _outputs: &mut PropagateOutputs<'_>,
    ) {
        // Labels cross the bridge instead of fanning out locally.
        if self.tx.send(BridgeItem::Labels(labels.to_vec())).is_ok() {
            self.peer.shared.interface.flag_external_change();
        }
    }
}

pub struct NetworkSource {
    rx: Receiver<BridgeItem>,
}

impl Block for NetworkSource {
    fn work(&mut self, io: &mut WorkContext<'_>) -> Result<(), Error> {
        let output = io.output(0)?;
        while let Ok(item) = self.rx.try_recv() {
            match item {
                BridgeItem::Chunk(chunk) => output.post_buffer(chunk),
                BridgeItem::Labels(labels) => {
                    for label in labels {
                        output.post_label_absolute(label);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Build a connected bridge pair: the sink lives in `src_env`, the source
/// in `dst_env`. Returns `(sink, source)`.
pub(crate) fn make_bridge(dtype: DType, src_env: u64, dst_env: u64) -> (BlockHandle, BlockHandle) {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = crossbeam_channel::unbounded();

    let source = BlockBuilder::new(format!("netsrc{n}"), NetworkSource { rx })
        .output(0usize, dtype, "")
        .environment(dst_env)
        .build();
    let sink = BlockBuilder::new(
        format!("netsink{n}"),
        NetworkSink {
            tx,
            peer: source.clone(),
        },
    )
    .input(0usize, dtype, "")
    .environment(src_env)
    .build();
    (sink, source)
}
