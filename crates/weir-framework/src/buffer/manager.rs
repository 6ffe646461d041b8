//! Buffer managers: domain-scoped pools feeding output ports.
//!
//! A manager hands out empty buffers and recycles their storage when the
//! last downstream reference drops. Exhaustion is not an error; it gates
//! block readiness until a buffer comes back, at which point the manager's
//! front-changed callback re-flags the owning actor.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use crate::buffer::chunk::BufferChunk;
use crate::buffer::shared::{BufferReclaim, SharedBuffer};
use crate::dtype::DType;

pub type FrontChangedFn = Arc<dyn Fn() + Send + Sync>;

pub trait BufferManager: BufferReclaim {
    /// Nonblocking acquire of the next empty buffer; `None` when exhausted.
    fn pop(&self) -> Option<SharedBuffer>;

    fn is_empty(&self) -> bool;

    /// Capacity in bytes of the next available buffer; zero when exhausted.
    fn front_len(&self) -> usize;

    /// Install the callback invoked whenever a buffer becomes available.
    fn set_callback(&self, front_changed: FrontChangedFn);
}

#[derive(Debug, Clone, Copy)]
pub struct BufferManagerArgs {
    pub num_buffers: usize,
    pub buffer_size: usize,
}

impl Default for BufferManagerArgs {
    fn default() -> Self {
        Self {
            num_buffers: 4,
            buffer_size: 8192,
        }
    }
}

impl BufferManagerArgs {
    /// Default sizing with the buffer length rounded to a whole number of
    /// samples of `dtype`.
    pub fn for_dtype(dtype: DType) -> Self {
        let elem = dtype.size().max(1);
        let default = BufferManagerArgs::default();
        Self {
            num_buffers: default.num_buffers,
            buffer_size: elem * (default.buffer_size / elem).max(1),
        }
    }
}

/// Slab of fixed-size buffers behind a free list.
pub struct GenericBufferManager {
    weak_self: Weak<GenericBufferManager>,
    free: Mutex<VecDeque<Box<[u8]>>>,
    callback: Mutex<Option<FrontChangedFn>>,
}

impl GenericBufferManager {
    pub fn new(args: BufferManagerArgs) -> Arc<GenericBufferManager> {
        Arc::new_cyclic(|weak_self| {
            let free = (0..args.num_buffers.max(1))
                .map(|_| vec![0u8; args.buffer_size.max(1)].into_boxed_slice())
                .collect();
            GenericBufferManager {
                weak_self: weak_self.clone(),
                free: Mutex::new(free),
                callback: Mutex::new(None),
            }
        })
    }

    fn notify_front_changed(&self) {
        let callback = self.callback.lock().expect("manager mutex poisoned").clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl BufferReclaim for GenericBufferManager {
    fn reclaim(&self, storage: Box<[u8]>) {
        self.free
            .lock()
            .expect("manager mutex poisoned")
            .push_back(storage);
        self.notify_front_changed();
    }
}

impl BufferManager for GenericBufferManager {
    fn pop(&self) -> Option<SharedBuffer> {
        let storage = self
            .free
            .lock()
            .expect("manager mutex poisoned")
            .pop_front()?;
        Some(SharedBuffer::pooled(
            storage,
            self.weak_self.clone() as Weak<dyn BufferReclaim>,
        ))
    }

    fn is_empty(&self) -> bool {
        self.free.lock().expect("manager mutex poisoned").is_empty()
    }

    fn front_len(&self) -> usize {
        self.free
            .lock()
            .expect("manager mutex poisoned")
            .front()
            .map(|storage| storage.len())
            .unwrap_or(0)
    }

    fn set_callback(&self, front_changed: FrontChangedFn) {
        *self.callback.lock().expect("manager mutex poisoned") = Some(front_changed);
    }
}

/// Rotating fixed window set over one logical region. Windows are reused
/// strictly in issue order, which keeps addresses moving in a ring the way
/// DMA engines expect.
pub struct CircularBufferManager {
    weak_self: Weak<CircularBufferManager>,
    state: Mutex<CircularState>,
    callback: Mutex<Option<FrontChangedFn>>,
}

struct CircularState {
    /// Windows waiting to be issued, in ring order.
    ready: VecDeque<Box<[u8]>>,
    /// Windows currently downstream.
    outstanding: usize,
}

impl CircularBufferManager {
    pub fn new(args: BufferManagerArgs) -> Arc<CircularBufferManager> {
        Arc::new_cyclic(|weak_self| {
            let ready = (0..args.num_buffers.max(2))
                .map(|_| vec![0u8; args.buffer_size.max(1)].into_boxed_slice())
                .collect();
            CircularBufferManager {
                weak_self: weak_self.clone(),
                state: Mutex::new(CircularState {
                    ready,
                    outstanding: 0,
                }),
                callback: Mutex::new(None),
            }
        })
    }

    fn notify_front_changed(&self) {
        let callback = self.callback.lock().expect("manager mutex poisoned").clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl BufferReclaim for CircularBufferManager {
    fn reclaim(&self, storage: Box<[u8]>) {
        {
            let mut state = self.state.lock().expect("manager mutex poisoned");
            state.outstanding = state.outstanding.saturating_sub(1);
            state.ready.push_back(storage);
        }
        self.notify_front_changed();
    }
}

impl BufferManager for CircularBufferManager {
    fn pop(&self) -> Option<SharedBuffer> {
        let mut state = self.state.lock().expect("manager mutex poisoned");
        let storage = state.ready.pop_front()?;
        state.outstanding += 1;
        drop(state);
        Some(SharedBuffer::pooled(
            storage,
            self.weak_self.clone() as Weak<dyn BufferReclaim>,
        ))
    }

    fn is_empty(&self) -> bool {
        self.state
            .lock()
            .expect("manager mutex poisoned")
            .ready
            .is_empty()
    }

    fn front_len(&self) -> usize {
        self.state
            .lock()
            .expect("manager mutex poisoned")
            .ready
            .front()
            .map(|storage| storage.len())
            .unwrap_or(0)
    }

    fn set_callback(&self, front_changed: FrontChangedFn) {
        *self.callback.lock().expect("manager mutex poisoned") = Some(front_changed);
    }
}

/// Forwards upstream buffers unmodified. The pool starts empty; chunks
/// injected with `inject` become the front buffer in arrival order, so a
/// block can re-emit upstream storage without a copy.
pub struct PassthroughBufferManager {
    queue: Mutex<VecDeque<BufferChunk>>,
    callback: Mutex<Option<FrontChangedFn>>,
}

impl PassthroughBufferManager {
    pub fn new() -> Arc<PassthroughBufferManager> {
        Arc::new(PassthroughBufferManager {
            queue: Mutex::new(VecDeque::new()),
            callback: Mutex::new(None),
        })
    }

    /// Hand an upstream chunk to the pool for re-emission.
    pub fn inject(&self, chunk: BufferChunk) {
        self.queue
            .lock()
            .expect("manager mutex poisoned")
            .push_back(chunk);
        let callback = self.callback.lock().expect("manager mutex poisoned").clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl BufferReclaim for PassthroughBufferManager {
    fn reclaim(&self, _storage: Box<[u8]>) {
        // Upstream storage belongs to the upstream pool; nothing is kept.
    }
}

impl BufferManager for PassthroughBufferManager {
    fn pop(&self) -> Option<SharedBuffer> {
        self.queue
            .lock()
            .expect("manager mutex poisoned")
            .pop_front()
            .and_then(|chunk| chunk.into_buffer())
    }

    fn is_empty(&self) -> bool {
        self.queue.lock().expect("manager mutex poisoned").is_empty()
    }

    fn front_len(&self) -> usize {
        self.queue
            .lock()
            .expect("manager mutex poisoned")
            .front()
            .map(|chunk| chunk.len())
            .unwrap_or(0)
    }

    fn set_callback(&self, front_changed: FrontChangedFn) {
        *self.callback.lock().expect("manager mutex poisoned") = Some(front_changed);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::{
        BufferManager, BufferManagerArgs, CircularBufferManager, GenericBufferManager,
        PassthroughBufferManager,
    };
    use crate::buffer::chunk::BufferChunk;
    use crate::dtype::{DType, ElemKind};

    #[test]
    fn generic_pool_exhausts_and_recovers() {
        let manager = GenericBufferManager::new(BufferManagerArgs {
            num_buffers: 2,
            buffer_size: 16,
        });
        let first = manager.pop().expect("first buffer");
        let second = manager.pop().expect("second buffer");
        assert!(manager.pop().is_none());
        assert!(manager.is_empty());
        assert_eq!(manager.front_len(), 0);

        drop(first);
        assert!(!manager.is_empty());
        assert_eq!(manager.front_len(), 16);
        drop(second);
        assert!(manager.pop().is_some());
    }

    #[test]
    fn callback_fires_when_a_buffer_returns() {
        let manager = GenericBufferManager::new(BufferManagerArgs {
            num_buffers: 1,
            buffer_size: 8,
        });
        let fired = Arc::new(AtomicUsize::new(0));
        let observer = Arc::clone(&fired);
        manager.set_callback(Arc::new(move || {
            observer.fetch_add(1, Ordering::Relaxed);
        }));

        let buffer = manager.pop().expect("buffer");
        assert_eq!(fired.load(Ordering::Relaxed), 0);
        drop(buffer);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn popped_buffers_are_uniquely_held() {
        let manager = GenericBufferManager::new(BufferManagerArgs::default());
        let mut buffer = manager.pop().expect("buffer");
        assert!(buffer.try_mut().is_some());
    }

    #[test]
    fn dtype_sizing_keeps_whole_samples() {
        let args = BufferManagerArgs::for_dtype(DType::new(ElemKind::I32).with_dimension(3));
        assert_eq!(args.buffer_size % 12, 0);
        assert!(args.buffer_size > 0);
    }

    #[test]
    fn circular_pool_cycles_through_its_windows() {
        let manager = CircularBufferManager::new(BufferManagerArgs {
            num_buffers: 2,
            buffer_size: 4,
        });
        let first = manager.pop().expect("window 0");
        let second = manager.pop().expect("window 1");
        assert!(manager.pop().is_none());
        drop(first);
        let third = manager.pop().expect("window 0 again");
        drop(second);
        drop(third);
        assert!(!manager.is_empty());
    }

    #[test]
    fn passthrough_pool_reissues_injected_chunks() {
        let manager = PassthroughBufferManager::new();
        assert!(manager.is_empty());
        manager.inject(BufferChunk::from_slice(
            &[1, 2, 3],
            DType::new(ElemKind::U8),
        ));
        assert_eq!(manager.front_len(), 3);
        let buffer = manager.pop().expect("injected buffer");
        assert_eq!(buffer.as_slice(), &[1, 2, 3]);
        assert!(manager.is_empty());
    }
}
