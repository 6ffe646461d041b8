//! Input port state: the consumer end of an edge.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::buffer::chunk::BufferChunk;
use crate::dtype::DType;
use crate::label::Label;
use crate::port::inbox::{InputInbox, SlotCall};

pub struct InputPort {
    name: String,
    index: Option<usize>,
    dtype: DType,
    domain: String,
    reserve: usize,
    is_slot: bool,
    automatic: bool,
    producers: usize,
    inbox: Arc<InputInbox>,
    queue: VecDeque<BufferChunk>,
    pending_labels: Vec<Label>,
    slot_calls: VecDeque<SlotCall>,
    total_consumed: u64,
    deferred_consume: usize,
    work_consumed: usize,
}

impl InputPort {
    pub(crate) fn new(
        name: String,
        dtype: DType,
        domain: String,
        inbox: Arc<InputInbox>,
    ) -> InputPort {
        let index = name.parse::<usize>().ok();
        InputPort {
            name,
            index,
            dtype,
            domain,
            reserve: 0,
            is_slot: false,
            automatic: false,
            producers: 0,
            inbox,
            queue: VecDeque::new(),
            pending_labels: Vec::new(),
            slot_calls: VecDeque::new(),
            total_consumed: 0,
            deferred_consume: 0,
            work_consumed: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Numeric index when the port name is a decimal spelling.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn is_slot(&self) -> bool {
        self.is_slot
    }

    pub(crate) fn mark_slot(&mut self) {
        self.is_slot = true;
    }

    pub(crate) fn is_automatic(&self) -> bool {
        self.automatic
    }

    pub(crate) fn mark_automatic(&mut self) {
        self.automatic = true;
    }

    pub(crate) fn inbox(&self) -> Arc<InputInbox> {
        Arc::clone(&self.inbox)
    }

    pub(crate) fn add_producer(&mut self) {
        self.producers += 1;
    }

    pub(crate) fn remove_producer(&mut self) {
        self.producers = self.producers.saturating_sub(1);
    }

    pub(crate) fn producer_count(&self) -> usize {
        self.producers
    }

    /// Minimum elements required before work runs.
    pub fn reserve(&self) -> usize {
        self.reserve
    }

    pub fn set_reserve(&mut self, elements: usize) {
        self.reserve = elements;
    }

    pub fn total_consumed(&self) -> u64 {
        self.total_consumed
    }

    pub fn available_bytes(&self) -> usize {
        self.queue.iter().map(BufferChunk::len).sum()
    }

    pub fn available_elements(&self) -> usize {
        self.available_bytes() / self.dtype.size().max(1)
    }

    /// Contiguous view of the front of the pending stream. Merging across
    /// chunk boundaries happens before work when the reserve demands it.
    pub fn buffer(&self) -> &[u8] {
        self.queue.front().map(BufferChunk::as_slice).unwrap_or(&[])
    }

    /// Pending labels, ordered by absolute element index.
    pub fn labels(&self) -> impl Iterator<Item = &Label> {
        self.pending_labels.iter()
    }

    /// Record the intent to consume `elements`; applied when the work call
    /// finishes.
    pub fn consume(&mut self, elements: usize) {
        self.deferred_consume += elements;
    }

    /// Remove and return the whole front chunk, advancing the consumed
    /// counter immediately. Used by forwarding blocks that re-emit upstream
    /// buffers without copying.
    pub fn take_front(&mut self) -> Option<BufferChunk> {
        let chunk = self.queue.pop_front()?;
        let elements = chunk.elements() as u64;
        self.total_consumed += elements;
        self.work_consumed += elements as usize;
        Some(chunk)
    }

    pub(crate) fn drain_inbox(&mut self) {
        let drained = self.inbox.drain();
        for chunk in drained.chunks {
            if !chunk.is_empty() {
                self.queue.push_back(chunk);
            }
        }
        for label in drained.labels {
            let at = self
                .pending_labels
                .partition_point(|pending| pending.index <= label.index);
            self.pending_labels.insert(at, label);
        }
        self.slot_calls.extend(drained.slot_calls);
    }

    pub(crate) fn take_slot_calls(&mut self) -> Vec<SlotCall> {
        self.slot_calls.drain(..).collect()
    }

    /// Merge leading chunks until the front holds at least `min_bytes`
    /// contiguously (or everything pending has been merged).
    pub(crate) fn merge_front(&mut self, min_bytes: usize) {
        while self.queue.front().map(BufferChunk::len).unwrap_or(0) < min_bytes
            && self.queue.len() > 1
        {
            let mut front = self.queue.pop_front().expect("checked non-empty");
            let next = self.queue.pop_front().expect("checked len > 1");
            front.append(&next);
            self.queue.push_front(front);
        }
    }

    /// Apply deferred consumption, advance the FIFO, and surface the labels
    /// that fell inside the consumed range. Returns the elements consumed by
    /// this work call (deferred and immediate paths combined).
    pub(crate) fn finish_work(&mut self) -> (usize, Vec<Label>) {
        let applied = self.deferred_consume.min(self.available_elements());
        self.deferred_consume = 0;
        let mut remaining_bytes = applied * self.dtype.size().max(1);
        while remaining_bytes > 0 {
            let Some(front) = self.queue.front_mut() else {
                break;
            };
            if front.len() <= remaining_bytes {
                remaining_bytes -= front.len();
                self.queue.pop_front();
            } else {
                front.advance(remaining_bytes);
                remaining_bytes = 0;
            }
        }
        self.total_consumed += applied as u64;

        let consumed = self.work_consumed + applied;
        self.work_consumed = 0;

        let boundary = self
            .pending_labels
            .partition_point(|label| label.index < self.total_consumed);
        let propagated = self.pending_labels.drain(..boundary).collect();
        (consumed, propagated)
    }
}

#[cfg(test)]
mod tests {
    use super::InputPort;
    use crate::arg::Arg;
    use crate::buffer::chunk::BufferChunk;
    use crate::dtype::{DType, ElemKind};
    use crate::label::Label;
    use crate::port::inbox::InputInbox;

    fn port(dtype: DType) -> InputPort {
        InputPort::new("0".to_string(), dtype, String::new(), InputInbox::new())
    }

    #[test]
    fn numeric_names_are_indexable() {
        let dtype = DType::new(ElemKind::U8);
        assert_eq!(port(dtype).index(), Some(0));
        let named = InputPort::new("in".to_string(), dtype, String::new(), InputInbox::new());
        assert_eq!(named.index(), None);
    }

    #[test]
    fn consume_applies_at_finish_and_advances_the_fifo() {
        let mut port = port(DType::new(ElemKind::U8));
        port.inbox().push_chunk(BufferChunk::from_slice(
            &[1, 2, 3],
            DType::new(ElemKind::U8),
        ));
        port.inbox()
            .push_chunk(BufferChunk::from_slice(&[4, 5], DType::new(ElemKind::U8)));
        port.drain_inbox();
        assert_eq!(port.available_elements(), 5);
        assert_eq!(port.buffer(), &[1, 2, 3]);

        port.consume(4);
        // Deferred until the work call finishes.
        assert_eq!(port.total_consumed(), 0);
        let (consumed, _labels) = port.finish_work();
        assert_eq!(consumed, 4);
        assert_eq!(port.total_consumed(), 4);
        assert_eq!(port.buffer(), &[5]);
    }

    #[test]
    fn merge_front_builds_a_contiguous_view() {
        let mut port = port(DType::new(ElemKind::U8));
        let dtype = DType::new(ElemKind::U8);
        port.inbox().push_chunk(BufferChunk::from_slice(&[1], dtype));
        port.inbox().push_chunk(BufferChunk::from_slice(&[2], dtype));
        port.inbox().push_chunk(BufferChunk::from_slice(&[3], dtype));
        port.drain_inbox();
        port.merge_front(3);
        assert_eq!(port.buffer(), &[1, 2, 3]);
    }

    #[test]
    fn labels_inside_the_consumed_range_surface_at_finish() {
        let mut port = port(DType::new(ElemKind::U8));
        let dtype = DType::new(ElemKind::U8);
        port.inbox()
            .push_chunk(BufferChunk::from_slice(&[0; 8], dtype));
        port.inbox().push_label(Label::new("early", Arg::unit(), 2));
        port.inbox().push_label(Label::new("late", Arg::unit(), 6));
        port.drain_inbox();

        port.consume(4);
        let (consumed, labels) = port.finish_work();
        assert_eq!(consumed, 4);
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].id, "early");
        // The late label stays pending for a future work call.
        assert_eq!(port.labels().count(), 1);
    }

    #[test]
    fn take_front_counts_elements_immediately() {
        let mut port = port(DType::new(ElemKind::I32));
        port.inbox().push_chunk(BufferChunk::from_slice(
            &[0u8; 12],
            DType::new(ElemKind::I32),
        ));
        port.drain_inbox();
        let chunk = port.take_front().expect("front chunk");
        assert_eq!(chunk.elements(), 3);
        assert_eq!(port.total_consumed(), 3);
        assert!(port.take_front().is_none());
    }
}
