//! Numeric buffer conversion.
//!
//! Conversions run scalar-by-scalar through a process-wide table keyed by
//! the (source, destination) element kinds. The table is built once and
//! read-only afterwards.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::buffer::chunk::BufferChunk;
use crate::dtype::{DType, ElemKind};
use crate::error::Error;

type ConvertFn = fn(&[u8]) -> Vec<u8>;

trait Scalar: Copy {
    const KIND: ElemKind;
    fn read(bytes: &[u8]) -> Self;
    fn write(self, out: &mut Vec<u8>);
    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_scalar {
    ($ty:ty, $kind:expr) => {
        impl Scalar for $ty {
            const KIND: ElemKind = $kind;

            fn read(bytes: &[u8]) -> Self {
                <$ty>::from_ne_bytes(bytes.try_into().expect("scalar width"))
            }

            fn write(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_ne_bytes());
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_f64(value: f64) -> Self {
                value as $ty
            }
        }
    };
}

impl_scalar!(i8, ElemKind::I8);
impl_scalar!(i16, ElemKind::I16);
impl_scalar!(i32, ElemKind::I32);
impl_scalar!(i64, ElemKind::I64);
impl_scalar!(u8, ElemKind::U8);
impl_scalar!(u16, ElemKind::U16);
impl_scalar!(u32, ElemKind::U32);
impl_scalar!(u64, ElemKind::U64);
impl_scalar!(f32, ElemKind::F32);
impl_scalar!(f64, ElemKind::F64);

fn convert_scalars<S: Scalar, D: Scalar>(input: &[u8]) -> Vec<u8> {
    let src_size = std::mem::size_of::<S>();
    let count = input.len() / src_size;
    let mut out = Vec::with_capacity(count * std::mem::size_of::<D>());
    for bytes in input.chunks_exact(src_size) {
        D::from_f64(S::read(bytes).to_f64()).write(&mut out);
    }
    out
}

macro_rules! register_from {
    ($table:expr, $src:ty) => {
        register_pair::<$src, i8>($table);
        register_pair::<$src, i16>($table);
        register_pair::<$src, i32>($table);
        register_pair::<$src, i64>($table);
        register_pair::<$src, u8>($table);
        register_pair::<$src, u16>($table);
        register_pair::<$src, u32>($table);
        register_pair::<$src, u64>($table);
        register_pair::<$src, f32>($table);
        register_pair::<$src, f64>($table);
    };
}

fn register_pair<S: Scalar, D: Scalar>(table: &mut HashMap<(ElemKind, ElemKind), ConvertFn>) {
    table.insert((S::KIND, D::KIND), convert_scalars::<S, D>);
}

fn converter_table() -> &'static HashMap<(ElemKind, ElemKind), ConvertFn> {
    static TABLE: OnceLock<HashMap<(ElemKind, ElemKind), ConvertFn>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = HashMap::new();
        register_from!(&mut table, i8);
        register_from!(&mut table, i16);
        register_from!(&mut table, i32);
        register_from!(&mut table, i64);
        register_from!(&mut table, u8);
        register_from!(&mut table, u16);
        register_from!(&mut table, u32);
        register_from!(&mut table, u64);
        register_from!(&mut table, f32);
        register_from!(&mut table, f64);
        table
    })
}

fn lookup(from: DType, to: DType) -> Result<ConvertFn, Error> {
    converter_table()
        .get(&(from.kind(), to.kind()))
        .copied()
        .ok_or_else(|| Error::BufferConvert {
            from: from.to_string(),
            to: to.to_string(),
        })
}

pub(crate) fn convert_chunk(chunk: &BufferChunk, dtype: DType) -> Result<BufferChunk, Error> {
    if chunk.dtype() == dtype {
        return Ok(chunk.clone());
    }
    if chunk.is_null() {
        let mut null = BufferChunk::default();
        null.set_dtype(dtype);
        return Ok(null);
    }
    // Complex pairing and vector shape must agree; only the scalar kind
    // changes here. Complex splitting has its own entry point.
    if chunk.dtype().is_complex() != dtype.is_complex()
        || chunk.dtype().dimension() != dtype.dimension()
    {
        return Err(Error::BufferConvert {
            from: chunk.dtype().to_string(),
            to: dtype.to_string(),
        });
    }
    let convert = lookup(chunk.dtype(), dtype)?;
    Ok(BufferChunk::from_slice(&convert(chunk.as_slice()), dtype))
}

pub(crate) fn convert_complex_chunk(
    chunk: &BufferChunk,
    dtype: DType,
) -> Result<(BufferChunk, BufferChunk), Error> {
    if !chunk.dtype().is_complex() || dtype.is_complex() {
        return Err(Error::BufferConvert {
            from: chunk.dtype().to_string(),
            to: dtype.to_string(),
        });
    }
    let scalar_kind = chunk.dtype().kind();
    let scalar_size = scalar_kind.size();
    let input = chunk.as_slice();

    // De-interleave (re, im) pairs, then convert each component stream.
    let pairs = input.len() / (scalar_size * 2);
    let mut re = Vec::with_capacity(pairs * scalar_size);
    let mut im = Vec::with_capacity(pairs * scalar_size);
    for pair in input.chunks_exact(scalar_size * 2) {
        re.extend_from_slice(&pair[..scalar_size]);
        im.extend_from_slice(&pair[scalar_size..]);
    }

    let scalar_dtype = DType::new(scalar_kind).with_dimension(chunk.dtype().dimension());
    let re_chunk = convert_chunk(&BufferChunk::from_slice(&re, scalar_dtype), dtype)?;
    let im_chunk = convert_chunk(&BufferChunk::from_slice(&im, scalar_dtype), dtype)?;
    Ok((re_chunk, im_chunk))
}
