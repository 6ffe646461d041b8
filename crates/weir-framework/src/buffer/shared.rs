//! Shared byte regions with pool-aware reclamation.

use std::ops::Range;
use std::sync::{Arc, Weak};

/// The pool side of buffer return. Storage issued by a pool comes back
/// through `reclaim` when the last view of it drops.
pub trait BufferReclaim: Send + Sync {
    fn reclaim(&self, storage: Box<[u8]>);
}

struct BufferInner {
    storage: Box<[u8]>,
    reclaim: Option<Weak<dyn BufferReclaim>>,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        if let Some(pool) = self.reclaim.take().and_then(|weak| weak.upgrade()) {
            pool.reclaim(std::mem::take(&mut self.storage));
        }
    }
}

/// A contiguous byte region with shared ownership. Slices share the parent's
/// storage; the region is freed (or returned to its issuing pool) when the
/// last view drops.
pub struct SharedBuffer {
    inner: Arc<BufferInner>,
    offset: usize,
    len: usize,
}

impl SharedBuffer {
    /// Allocate a zeroed region with no backing pool.
    pub fn allocate(len: usize) -> SharedBuffer {
        SharedBuffer::from_storage(vec![0u8; len].into_boxed_slice(), None)
    }

    pub fn from_vec(bytes: Vec<u8>) -> SharedBuffer {
        SharedBuffer::from_storage(bytes.into_boxed_slice(), None)
    }

    /// Wrap storage issued by a pool; the storage flows back through
    /// `reclaim` once every view drops.
    pub fn pooled(storage: Box<[u8]>, pool: Weak<dyn BufferReclaim>) -> SharedBuffer {
        SharedBuffer::from_storage(storage, Some(pool))
    }

    fn from_storage(storage: Box<[u8]>, reclaim: Option<Weak<dyn BufferReclaim>>) -> SharedBuffer {
        let len = storage.len();
        SharedBuffer {
            inner: Arc::new(BufferInner { storage, reclaim }),
            offset: 0,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Capacity of the whole underlying region, independent of this view.
    pub fn capacity(&self) -> usize {
        self.inner.storage.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.inner.storage[self.offset..self.offset + self.len]
    }

    /// A sub-range of this view sharing ownership of the storage.
    pub fn slice(&self, range: Range<usize>) -> SharedBuffer {
        assert!(
            range.start <= range.end && range.end <= self.len,
            "slice {range:?} out of bounds for buffer of {} bytes",
            self.len
        );
        SharedBuffer {
            inner: Arc::clone(&self.inner),
            offset: self.offset + range.start,
            len: range.end - range.start,
        }
    }

    /// Mutable access to this view. Succeeds only while this is the sole
    /// reference to the storage, which is the state right after a pool pop.
    pub fn try_mut(&mut self) -> Option<&mut [u8]> {
        let offset = self.offset;
        let len = self.len;
        Arc::get_mut(&mut self.inner).map(|inner| &mut inner.storage[offset..offset + len])
    }

    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }
}

impl Clone for SharedBuffer {
    fn clone(&self) -> Self {
        SharedBuffer {
            inner: Arc::clone(&self.inner),
            offset: self.offset,
            len: self.len,
        }
    }
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}
