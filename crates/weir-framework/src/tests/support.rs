//! Test blocks and polling helpers shared by the scenario tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::arg::Arg;
use crate::block::{Block, PropagateOutputs, WorkContext};
use crate::buffer::chunk::BufferChunk;
use crate::dtype::DType;
use crate::error::Error;
use crate::handle::{BlockBuilder, BlockHandle};
use crate::label::Label;
use crate::port::input::InputPort;

/// Route framework logs through the test harness capture. Safe to call
/// from every test; only the first call installs the subscriber.
pub fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// Wait for a condition with a deadline; true when it held in time.
pub fn poll_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

enum FeedItem {
    Chunk(BufferChunk),
    Label(Label),
}

/// Posts queued chunks (and labels) on output 0, in feed order. Feeding
/// happens through the registered `feed` / `feed_label` calls, so it is
/// serialized with work like any other control access.
pub struct FeederSource {
    pending: VecDeque<FeedItem>,
}

impl Block for FeederSource {
    fn work(&mut self, io: &mut WorkContext<'_>) -> Result<(), Error> {
        let output = io.output(0)?;
        while let Some(item) = self.pending.pop_front() {
            match item {
                FeedItem::Chunk(chunk) => output.post_buffer(chunk),
                FeedItem::Label(label) => output.post_label(label),
            }
        }
        Ok(())
    }
}

pub fn make_feeder(name: &str, dtype: DType, domain: &str) -> BlockHandle {
    init_logging();
    BlockBuilder::new(
        name,
        FeederSource {
            pending: VecDeque::new(),
        },
    )
    .output(0usize, dtype, domain)
    .call("feed", |block: &mut FeederSource, args: &[Arg]| {
        let chunk = args[0].extract::<BufferChunk>()?.clone();
        block.pending.push_back(FeedItem::Chunk(chunk));
        Ok(Arg::unit())
    })
    .call("feed_label", |block: &mut FeederSource, args: &[Arg]| {
        let label = args[0].extract::<Label>()?.clone();
        block.pending.push_back(FeedItem::Label(label));
        Ok(Arg::unit())
    })
    .build()
}

pub fn feed(feeder: &BlockHandle, bytes: &[u8], dtype: DType) {
    feeder
        .call("feed", &[Arg::new(BufferChunk::from_slice(bytes, dtype))])
        .expect("feed should succeed");
}

/// Observed label propagation: the label plus the input's consumed counter
/// at the moment it was dispatched.
pub struct SeenLabel {
    pub id: String,
    pub index: u64,
    pub consumed_at_dispatch: u64,
}

/// Appends every consumed byte (and records surfaced labels) on input 0.
pub struct CollectorSink {
    bytes: Arc<Mutex<Vec<u8>>>,
    labels: Arc<Mutex<Vec<SeenLabel>>>,
}

impl Block for CollectorSink {
    fn work(&mut self, io: &mut WorkContext<'_>) -> Result<(), Error> {
        let input = io.input(0)?;
        let mut bytes = self.bytes.lock().expect("collector mutex");
        while let Some(chunk) = input.take_front() {
            bytes.extend_from_slice(chunk.as_slice());
        }
        Ok(())
    }

    fn propagate_labels(
        &mut self,
        input: &InputPort,
        labels: &[Label],
        _outputs: &mut PropagateOutputs<'_>,
    ) {
        let mut seen = self.labels.lock().expect("collector mutex");
        for label in labels {
            seen.push(SeenLabel {
                id: label.id.clone(),
                index: label.index,
                consumed_at_dispatch: input.total_consumed(),
            });
        }
    }
}

pub struct Collector {
    pub handle: BlockHandle,
    pub bytes: Arc<Mutex<Vec<u8>>>,
    pub labels: Arc<Mutex<Vec<SeenLabel>>>,
}

pub fn make_collector(name: &str, dtype: DType, domain: &str) -> Collector {
    collector_builder(name, dtype, domain, 0)
}

/// A collector living in another environment, for bridge tests.
pub fn make_collector_in_env(name: &str, dtype: DType, env_id: u64) -> Collector {
    collector_builder(name, dtype, "", env_id)
}

fn collector_builder(name: &str, dtype: DType, domain: &str, env_id: u64) -> Collector {
    init_logging();
    let bytes = Arc::new(Mutex::new(Vec::new()));
    let labels = Arc::new(Mutex::new(Vec::new()));
    let handle = BlockBuilder::new(
        name,
        CollectorSink {
            bytes: Arc::clone(&bytes),
            labels: Arc::clone(&labels),
        },
    )
    .input(0usize, dtype, domain)
    .environment(env_id)
    .build();
    Collector {
        handle,
        bytes,
        labels,
    }
}

impl Collector {
    pub fn byte_count(&self) -> usize {
        self.bytes.lock().expect("collector mutex").len()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.bytes.lock().expect("collector mutex").clone()
    }
}

/// Endless source: fills every available output buffer with a running byte
/// counter. Throttled by pool exhaustion, resumed by the return callback.
pub struct CounterSource {
    next: u8,
}

impl CounterSource {
    pub fn new() -> CounterSource {
        CounterSource { next: 0 }
    }
}

impl Block for CounterSource {
    fn work(&mut self, io: &mut WorkContext<'_>) -> Result<(), Error> {
        let output = io.output(0)?;
        let buffer = output.buffer_mut();
        if buffer.is_empty() {
            return Ok(());
        }
        let len = buffer.len();
        for slot in buffer.iter_mut() {
            *slot = self.next;
            self.next = self.next.wrapping_add(1);
        }
        output.produce(len);
        Ok(())
    }
}

/// Sink collecting into multiple numeric inputs, exercising auto-allocated
/// ports.
pub struct MultiCollector {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl Block for MultiCollector {
    fn work(&mut self, io: &mut WorkContext<'_>) -> Result<(), Error> {
        let mut bytes = self.bytes.lock().expect("collector mutex");
        for index in 0..8 {
            let Ok(input) = io.input(index) else {
                continue;
            };
            while let Some(chunk) = input.take_front() {
                bytes.extend_from_slice(chunk.as_slice());
            }
        }
        Ok(())
    }
}

pub fn make_multi_collector(name: &str, dtype: DType) -> (BlockHandle, Arc<Mutex<Vec<u8>>>) {
    init_logging();
    let bytes = Arc::new(Mutex::new(Vec::new()));
    let handle = BlockBuilder::new(
        name,
        MultiCollector {
            bytes: Arc::clone(&bytes),
        },
    )
    .input(0usize, dtype, "")
    .build();
    (handle, bytes)
}
