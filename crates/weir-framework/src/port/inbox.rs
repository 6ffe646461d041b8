//! Cross-thread ingress for input ports.
//!
//! Producers and signal emitters run on other actors' threads; they push
//! into this internally synchronized inbox and flag the owning actor. The
//! owner drains the inbox into its port state under its own lock, so the
//! pushing side never touches the consumer's actor mutex.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::arg::Arg;
use crate::buffer::chunk::BufferChunk;
use crate::label::Label;

/// A queued slot invocation: the destination slot's name plus the emitted
/// argument list.
pub(crate) struct SlotCall {
    pub name: String,
    pub args: Vec<Arg>,
}

#[derive(Default)]
pub(crate) struct Drained {
    pub chunks: Vec<BufferChunk>,
    pub labels: Vec<Label>,
    pub slot_calls: Vec<SlotCall>,
}

#[derive(Default)]
struct InboxQueues {
    chunks: VecDeque<BufferChunk>,
    labels: VecDeque<Label>,
    slot_calls: VecDeque<SlotCall>,
}

#[derive(Default)]
pub(crate) struct InputInbox {
    queues: Mutex<InboxQueues>,
}

impl InputInbox {
    pub fn new() -> Arc<InputInbox> {
        Arc::new(InputInbox::default())
    }

    fn guard(&self) -> MutexGuard<'_, InboxQueues> {
        self.queues.lock().expect("input inbox mutex poisoned")
    }

    pub fn push_chunk(&self, chunk: BufferChunk) {
        self.guard().chunks.push_back(chunk);
    }

    pub fn push_label(&self, label: Label) {
        self.guard().labels.push_back(label);
    }

    pub fn push_slot_call(&self, call: SlotCall) {
        self.guard().slot_calls.push_back(call);
    }

    pub fn drain(&self) -> Drained {
        let mut queues = self.guard();
        Drained {
            chunks: queues.chunks.drain(..).collect(),
            labels: queues.labels.drain(..).collect(),
            slot_calls: queues.slot_calls.drain(..).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        let queues = self.guard();
        queues.chunks.is_empty() && queues.labels.is_empty() && queues.slot_calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{InputInbox, SlotCall};
    use crate::arg::Arg;
    use crate::buffer::chunk::BufferChunk;
    use crate::dtype::{DType, ElemKind};
    use crate::label::Label;

    #[test]
    fn drain_preserves_arrival_order() {
        let inbox = InputInbox::new();
        let dtype = DType::new(ElemKind::U8);
        inbox.push_chunk(BufferChunk::from_slice(&[1], dtype));
        inbox.push_chunk(BufferChunk::from_slice(&[2], dtype));
        inbox.push_label(Label::new("mark", Arg::unit(), 0));
        inbox.push_slot_call(SlotCall {
            name: "set".to_string(),
            args: vec![Arg::new(1i32)],
        });

        let drained = inbox.drain();
        assert_eq!(drained.chunks.len(), 2);
        assert_eq!(drained.chunks[0].as_slice(), &[1]);
        assert_eq!(drained.chunks[1].as_slice(), &[2]);
        assert_eq!(drained.labels.len(), 1);
        assert_eq!(drained.slot_calls.len(), 1);
        assert!(inbox.is_empty());
    }
}
