//! Output port state: the producer end of an edge.

use std::sync::Arc;

use crate::arg::Arg;
use crate::buffer::chunk::BufferChunk;
use crate::buffer::manager::{BufferManager, FrontChangedFn};
use crate::buffer::shared::SharedBuffer;
use crate::dtype::DType;
use crate::label::Label;
use crate::port::inbox::{InputInbox, SlotCall};

/// Something that can be re-flagged when data lands in its inbox.
pub(crate) trait WakeTarget: Send + Sync {
    fn wake(&self);
}

/// One subscribed destination: the peer's inbox plus enough identity to
/// match an unsubscribe.
pub(crate) struct Subscriber {
    pub port_name: String,
    pub block_uid: u64,
    pub inbox: Arc<InputInbox>,
    pub wake: Arc<dyn WakeTarget>,
}

pub struct OutputPort {
    name: String,
    index: Option<usize>,
    dtype: DType,
    domain: String,
    is_signal: bool,
    automatic: bool,
    manager: Option<Arc<dyn BufferManager>>,
    subscribers: Vec<Subscriber>,
    front: Option<SharedBuffer>,
    total_produced: u64,
    produced_this_work: usize,
    posted_this_work: usize,
}

impl OutputPort {
    pub(crate) fn new(name: String, dtype: DType, domain: String) -> OutputPort {
        let index = name.parse::<usize>().ok();
        OutputPort {
            name,
            index,
            dtype,
            domain,
            is_signal: false,
            automatic: false,
            manager: None,
            subscribers: Vec::new(),
            front: None,
            total_produced: 0,
            produced_this_work: 0,
            posted_this_work: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn is_signal(&self) -> bool {
        self.is_signal
    }

    pub(crate) fn mark_signal(&mut self) {
        self.is_signal = true;
    }

    pub(crate) fn is_automatic(&self) -> bool {
        self.automatic
    }

    pub(crate) fn mark_automatic(&mut self) {
        self.automatic = true;
    }

    pub fn total_produced(&self) -> u64 {
        self.total_produced
    }

    pub(crate) fn manager(&self) -> Option<&Arc<dyn BufferManager>> {
        self.manager.as_ref()
    }

    pub(crate) fn set_manager(&mut self, manager: Arc<dyn BufferManager>, wake: FrontChangedFn) {
        manager.set_callback(wake);
        self.front = None;
        self.manager = Some(manager);
    }

    pub(crate) fn add_subscriber(&mut self, subscriber: Subscriber) {
        self.subscribers.push(subscriber);
    }

    pub(crate) fn remove_subscriber(&mut self, block_uid: u64, port_name: &str) -> bool {
        let before = self.subscribers.len();
        self.subscribers
            .retain(|sub| !(sub.block_uid == block_uid && sub.port_name == port_name));
        self.subscribers.len() != before
    }

    pub(crate) fn has_subscribers(&self) -> bool {
        !self.subscribers.is_empty()
    }

    /// Whether a writable buffer is on hand or the pool can supply one.
    pub(crate) fn ready(&self) -> bool {
        self.front.is_some()
            || self
                .manager
                .as_ref()
                .map(|manager| !manager.is_empty())
                .unwrap_or(false)
    }

    /// Elements the next work call could write.
    pub fn elements_available(&self) -> usize {
        let bytes = match (&self.front, &self.manager) {
            (Some(front), _) => front.len(),
            (None, Some(manager)) => manager.front_len(),
            (None, None) => 0,
        };
        bytes / self.dtype.size().max(1)
    }

    /// Writable view of the pool's front buffer. Empty when the pool is
    /// exhausted; readiness gating normally prevents that during work.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        if self.front.is_none() {
            self.front = self.manager.as_ref().and_then(|manager| manager.pop());
        }
        match self.front.as_mut() {
            Some(front) => front.try_mut().unwrap_or(&mut []),
            None => &mut [],
        }
    }

    /// Mark the first `elements` of the writable buffer as produced. The
    /// bytes are dispatched when the work call finishes.
    pub fn produce(&mut self, elements: usize) {
        self.produced_this_work += elements;
    }

    /// Attach a label to the stream. The index is relative to the start of
    /// the region being produced by the current work call; it is rebased to
    /// the absolute element counter here.
    pub fn post_label(&mut self, label: Label) {
        let absolute = self.total_produced + self.produced_this_work as u64 + label.index;
        let rebased = label.at_index(absolute);
        self.post_label_absolute(rebased);
    }

    /// Post a label already carrying an absolute element index.
    pub(crate) fn post_label_absolute(&mut self, label: Label) {
        for subscriber in &self.subscribers {
            subscriber.inbox.push_label(label.clone());
            subscriber.wake.wake();
        }
    }

    /// Zero-copy emit of an arbitrary chunk: every subscriber receives a
    /// reference to the same bytes and is flagged.
    pub fn post_buffer(&mut self, chunk: BufferChunk) {
        let elements = chunk.elements();
        for subscriber in &self.subscribers {
            subscriber.inbox.push_chunk(chunk.clone());
            subscriber.wake.wake();
        }
        self.total_produced += elements as u64;
        self.posted_this_work += elements;
    }

    /// Deliver signal args to every subscribed slot. Zero subscribers is a
    /// successful no-op; the args are dropped.
    pub(crate) fn emit_signal(&mut self, args: Vec<Arg>) {
        for subscriber in &self.subscribers {
            subscriber.inbox.push_slot_call(SlotCall {
                name: subscriber.port_name.clone(),
                args: args.clone(),
            });
            subscriber.wake.wake();
        }
    }

    /// Dispatch the region produced during this work call. Returns the
    /// elements this work call moved downstream, posted chunks included.
    pub(crate) fn flush(&mut self) -> usize {
        let posted = self.posted_this_work;
        self.posted_this_work = 0;
        if self.produced_this_work == 0 {
            return posted;
        }
        let elements = match &self.front {
            Some(front) => self
                .produced_this_work
                .min(front.len() / self.dtype.size().max(1)),
            None => 0,
        };
        self.produced_this_work = 0;
        if elements == 0 {
            return posted;
        }

        let front = self.front.take().expect("front present when produced");
        let bytes = elements * self.dtype.size().max(1);
        let chunk = BufferChunk::from_buffer(front.slice(0..bytes), self.dtype);
        // The remainder of the pool buffer rides along unreferenced; the
        // storage returns to the pool once the consumers are done with it.
        for subscriber in &self.subscribers {
            subscriber.inbox.push_chunk(chunk.clone());
            subscriber.wake.wake();
        }
        self.total_produced += elements as u64;
        posted + elements
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::{OutputPort, Subscriber, WakeTarget};
    use crate::arg::Arg;
    use crate::buffer::manager::{BufferManagerArgs, GenericBufferManager};
    use crate::dtype::{DType, ElemKind};
    use crate::label::Label;
    use crate::port::inbox::InputInbox;

    #[derive(Default)]
    struct CountingWake {
        count: AtomicUsize,
    }

    impl WakeTarget for CountingWake {
        fn wake(&self) {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn subscribed_port() -> (OutputPort, Arc<InputInbox>, Arc<CountingWake>) {
        let mut port = OutputPort::new("0".to_string(), DType::new(ElemKind::U8), String::new());
        let inbox = InputInbox::new();
        let wake = Arc::new(CountingWake::default());
        port.add_subscriber(Subscriber {
            port_name: "0".to_string(),
            block_uid: 7,
            inbox: Arc::clone(&inbox),
            wake: Arc::clone(&wake) as Arc<dyn WakeTarget>,
        });
        (port, inbox, wake)
    }

    #[test]
    fn produce_and_flush_dispatch_the_written_region() {
        let (mut port, inbox, wake) = subscribed_port();
        let manager = GenericBufferManager::new(BufferManagerArgs {
            num_buffers: 2,
            buffer_size: 8,
        });
        port.set_manager(manager, Arc::new(|| {}));

        let buffer = port.buffer_mut();
        buffer[..4].copy_from_slice(&[1, 2, 3, 4]);
        port.produce(4);
        assert_eq!(port.flush(), 4);
        assert_eq!(port.total_produced(), 4);
        assert!(wake.count.load(Ordering::Relaxed) >= 1);

        let drained = inbox.drain();
        assert_eq!(drained.chunks.len(), 1);
        assert_eq!(drained.chunks[0].as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn post_buffer_is_zero_copy_to_every_subscriber() {
        let (mut port, inbox, _wake) = subscribed_port();
        let second_inbox = InputInbox::new();
        port.add_subscriber(Subscriber {
            port_name: "0".to_string(),
            block_uid: 8,
            inbox: Arc::clone(&second_inbox),
            wake: Arc::new(CountingWake::default()),
        });

        let chunk =
            crate::buffer::chunk::BufferChunk::from_slice(&[9, 9], DType::new(ElemKind::U8));
        port.post_buffer(chunk);
        assert_eq!(port.total_produced(), 2);

        let first = inbox.drain().chunks;
        let second = second_inbox.drain().chunks;
        assert_eq!(first[0].as_slice(), &[9, 9]);
        assert_eq!(second[0].as_slice(), &[9, 9]);
    }

    #[test]
    fn labels_are_rebased_onto_the_stream_counter() {
        let (mut port, inbox, _wake) = subscribed_port();
        port.post_buffer(crate::buffer::chunk::BufferChunk::from_slice(
            &[0; 10],
            DType::new(ElemKind::U8),
        ));
        port.post_label(Label::new("mark", Arg::unit(), 3));
        let drained = inbox.drain();
        assert_eq!(drained.labels[0].index, 13);
    }

    #[test]
    fn signal_with_zero_subscribers_drops_the_args() {
        let mut port = OutputPort::new("value".to_string(), DType::default(), String::new());
        port.mark_signal();
        port.emit_signal(vec![Arg::new(42i32)]);
        assert_eq!(port.total_produced(), 0);
    }

    #[test]
    fn unsubscribe_matches_by_block_and_port() {
        let (mut port, _inbox, _wake) = subscribed_port();
        assert!(!port.remove_subscriber(7, "1"));
        assert!(port.remove_subscriber(7, "0"));
        assert!(!port.has_subscribers());
    }
}
