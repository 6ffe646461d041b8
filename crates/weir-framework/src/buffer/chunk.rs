//! Typed views over shared buffers.
//!
//! A chunk is the unit that travels along an edge: a possibly-null buffer
//! reference plus the dtype of its payload. Chunks are cheap to clone; the
//! bytes are shared, not copied.

use std::sync::OnceLock;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::buffer::convert;
use crate::buffer::shared::SharedBuffer;
use crate::dtype::DType;
use crate::error::Error;

#[derive(Clone, Default)]
pub struct BufferChunk {
    buffer: Option<SharedBuffer>,
    dtype: DType,
}

impl BufferChunk {
    /// The shared null chunk.
    pub fn null() -> &'static BufferChunk {
        static NULL: OnceLock<BufferChunk> = OnceLock::new();
        NULL.get_or_init(BufferChunk::default)
    }

    pub fn allocate(bytes: usize, dtype: DType) -> BufferChunk {
        BufferChunk {
            buffer: Some(SharedBuffer::allocate(bytes)),
            dtype,
        }
    }

    pub fn from_slice(bytes: &[u8], dtype: DType) -> BufferChunk {
        BufferChunk {
            buffer: Some(SharedBuffer::from_vec(bytes.to_vec())),
            dtype,
        }
    }

    pub fn from_buffer(buffer: SharedBuffer, dtype: DType) -> BufferChunk {
        BufferChunk {
            buffer: Some(buffer),
            dtype,
        }
    }

    pub fn is_null(&self) -> bool {
        self.buffer.is_none()
    }

    pub fn len(&self) -> usize {
        self.buffer.as_ref().map(SharedBuffer::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whole samples contained in this chunk.
    pub fn elements(&self) -> usize {
        self.len() / self.dtype.size().max(1)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn set_dtype(&mut self, dtype: DType) {
        self.dtype = dtype;
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buffer.as_ref().map(SharedBuffer::as_slice).unwrap_or(&[])
    }

    pub fn buffer(&self) -> Option<&SharedBuffer> {
        self.buffer.as_ref()
    }

    pub fn into_buffer(self) -> Option<SharedBuffer> {
        self.buffer
    }

    /// Append another chunk's bytes. A null chunk adopts the other's buffer
    /// by reference; otherwise a new region is allocated and both payloads
    /// are copied into it.
    pub fn append(&mut self, other: &BufferChunk) {
        if self.is_null() {
            *self = other.clone();
            return;
        }
        let mut merged = SharedBuffer::allocate(self.len() + other.len());
        let dst = merged.try_mut().expect("freshly allocated buffer is unique");
        dst[..self.len()].copy_from_slice(self.as_slice());
        dst[self.len()..].copy_from_slice(other.as_slice());
        self.buffer = Some(merged);
    }

    /// Drop `bytes` from the front of the view, sharing the remainder.
    pub fn advance(&mut self, bytes: usize) {
        if let Some(buffer) = self.buffer.as_ref() {
            let bytes = bytes.min(buffer.len());
            self.buffer = Some(buffer.slice(bytes..buffer.len()));
        }
    }

    /// Split off the first `bytes` as a chunk sharing ownership.
    pub fn split_front(&mut self, bytes: usize) -> BufferChunk {
        match self.buffer.as_ref() {
            None => BufferChunk {
                buffer: None,
                dtype: self.dtype,
            },
            Some(buffer) => {
                let bytes = bytes.min(buffer.len());
                let front = buffer.slice(0..bytes);
                self.buffer = Some(buffer.slice(bytes..buffer.len()));
                BufferChunk {
                    buffer: Some(front),
                    dtype: self.dtype,
                }
            }
        }
    }

    /// Element-wise conversion to another dtype. Identity when the dtypes
    /// already match.
    pub fn convert(&self, dtype: DType) -> Result<BufferChunk, Error> {
        convert::convert_chunk(self, dtype)
    }

    /// Split a complex stream into its real and imaginary component
    /// streams, converted to `dtype`.
    pub fn convert_complex(&self, dtype: DType) -> Result<(BufferChunk, BufferChunk), Error> {
        convert::convert_complex_chunk(self, dtype)
    }
}

impl std::fmt::Debug for BufferChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "BufferChunk(null)")
        } else {
            write!(f, "BufferChunk({} bytes, {})", self.len(), self.dtype)
        }
    }
}

/// Wire record: `(is_null, length, raw bytes, dtype)`. Non-null payloads
/// round-trip byte-identically.
#[derive(Serialize, Deserialize)]
struct ChunkRecord {
    is_null: bool,
    length: u32,
    bytes: Vec<u8>,
    dtype: DType,
}

impl Serialize for BufferChunk {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ChunkRecord {
            is_null: self.is_null(),
            length: self.len() as u32,
            bytes: self.as_slice().to_vec(),
            dtype: self.dtype,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BufferChunk {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let record = ChunkRecord::deserialize(deserializer)?;
        if record.is_null {
            return Ok(BufferChunk::default());
        }
        if record.bytes.len() != record.length as usize {
            return Err(D::Error::custom(format!(
                "buffer record length {} does not match payload of {} bytes",
                record.length,
                record.bytes.len()
            )));
        }
        Ok(BufferChunk {
            buffer: Some(SharedBuffer::from_vec(record.bytes)),
            dtype: record.dtype,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::BufferChunk;
    use crate::dtype::{DType, ElemKind};

    #[test]
    fn null_chunk_has_no_payload() {
        let chunk = BufferChunk::null();
        assert!(chunk.is_null());
        assert_eq!(chunk.len(), 0);
        assert_eq!(chunk.elements(), 0);
        assert!(chunk.as_slice().is_empty());
    }

    #[test]
    fn append_adopts_into_null_and_concatenates_otherwise() {
        let dtype = DType::new(ElemKind::U8);
        let mut chunk = BufferChunk::default();
        chunk.append(&BufferChunk::from_slice(&[1, 2], dtype));
        assert_eq!(chunk.as_slice(), &[1, 2]);

        chunk.append(&BufferChunk::from_slice(&[3, 4, 5], dtype));
        assert_eq!(chunk.as_slice(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn split_front_shares_ownership() {
        let mut chunk = BufferChunk::from_slice(&[1, 2, 3, 4], DType::new(ElemKind::U8));
        let front = chunk.split_front(3);
        assert_eq!(front.as_slice(), &[1, 2, 3]);
        assert_eq!(chunk.as_slice(), &[4]);
    }

    #[test]
    fn elements_follow_the_dtype_size() {
        let chunk = BufferChunk::from_slice(&[0u8; 24], DType::new(ElemKind::I32));
        assert_eq!(chunk.elements(), 6);
        let chunk = BufferChunk::from_slice(&[0u8; 24], DType::complex(ElemKind::F32));
        assert_eq!(chunk.elements(), 3);
    }

    #[test]
    fn serde_round_trip_is_byte_identical() {
        let dtype = DType::new(ElemKind::I16).with_dimension(2);
        let chunk = BufferChunk::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8], dtype);
        let json = serde_json::to_string(&chunk).expect("serialize chunk");
        let back: BufferChunk = serde_json::from_str(&json).expect("deserialize chunk");
        assert_eq!(back.as_slice(), chunk.as_slice());
        assert_eq!(back.dtype(), dtype);
    }

    #[test]
    fn serde_round_trip_preserves_null() {
        let json = serde_json::to_string(BufferChunk::null()).expect("serialize null");
        let back: BufferChunk = serde_json::from_str(&json).expect("deserialize null");
        assert!(back.is_null());
    }
}
