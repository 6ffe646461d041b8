//! Element data types carried by streaming ports and buffers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Scalar element kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElemKind {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl ElemKind {
    /// Bytes per scalar of this kind.
    pub fn size(self) -> usize {
        match self {
            ElemKind::I8 | ElemKind::U8 => 1,
            ElemKind::I16 | ElemKind::U16 => 2,
            ElemKind::I32 | ElemKind::U32 | ElemKind::F32 => 4,
            ElemKind::I64 | ElemKind::U64 | ElemKind::F64 => 8,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ElemKind::I8 => "i8",
            ElemKind::I16 => "i16",
            ElemKind::I32 => "i32",
            ElemKind::I64 => "i64",
            ElemKind::U8 => "u8",
            ElemKind::U16 => "u16",
            ElemKind::U32 => "u32",
            ElemKind::U64 => "u64",
            ElemKind::F32 => "f32",
            ElemKind::F64 => "f64",
        }
    }
}

/// A sample type: scalar kind, optional complex pairing, and the number of
/// elements per logical sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DType {
    kind: ElemKind,
    complex: bool,
    dimension: usize,
}

impl DType {
    pub fn new(kind: ElemKind) -> Self {
        Self {
            kind,
            complex: false,
            dimension: 1,
        }
    }

    pub fn complex(kind: ElemKind) -> Self {
        Self {
            kind,
            complex: true,
            dimension: 1,
        }
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension.max(1);
        self
    }

    pub fn kind(&self) -> ElemKind {
        self.kind
    }

    pub fn is_complex(&self) -> bool {
        self.complex
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Bytes per element: scalar size, doubled for complex pairs.
    pub fn elem_size(&self) -> usize {
        self.kind.size() * if self.complex { 2 } else { 1 }
    }

    /// Bytes per logical sample.
    pub fn size(&self) -> usize {
        self.elem_size() * self.dimension
    }

    /// Scalar count per logical sample, counting complex pairs as two.
    pub(crate) fn scalars_per_element(&self) -> usize {
        self.dimension * if self.complex { 2 } else { 1 }
    }
}

impl Default for DType {
    fn default() -> Self {
        DType::new(ElemKind::U8)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.complex {
            write!(f, "complex_{}", self.kind.name())?;
        } else {
            write!(f, "{}", self.kind.name())?;
        }
        if self.dimension > 1 {
            write!(f, "[{}]", self.dimension)?;
        }
        Ok(())
    }
}

impl FromStr for DType {
    type Err = Error;

    /// Parse names in the `Display` form: `u8`, `complex_f32`, `i16[4]`.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let bad = || Error::DataFormat(format!("unknown dtype '{text}'"));

        let (body, dimension) = match text.split_once('[') {
            None => (text, 1),
            Some((body, rest)) => {
                let digits = rest.strip_suffix(']').ok_or_else(bad)?;
                (body, digits.parse::<usize>().map_err(|_| bad())?)
            }
        };
        let (complex, kind_name) = match body.strip_prefix("complex_") {
            Some(kind_name) => (true, kind_name),
            None => (false, body),
        };
        let kind = match kind_name {
            "i8" => ElemKind::I8,
            "i16" => ElemKind::I16,
            "i32" => ElemKind::I32,
            "i64" => ElemKind::I64,
            "u8" => ElemKind::U8,
            "u16" => ElemKind::U16,
            "u32" => ElemKind::U32,
            "u64" => ElemKind::U64,
            "f32" => ElemKind::F32,
            "f64" => ElemKind::F64,
            _ => return Err(bad()),
        };
        let mut dtype = if complex {
            DType::complex(kind)
        } else {
            DType::new(kind)
        };
        if dimension == 0 {
            return Err(bad());
        }
        dtype = dtype.with_dimension(dimension);
        Ok(dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::{DType, ElemKind};

    #[test]
    fn sizes_account_for_complex_and_dimension() {
        assert_eq!(DType::new(ElemKind::U8).size(), 1);
        assert_eq!(DType::new(ElemKind::I32).size(), 4);
        assert_eq!(DType::complex(ElemKind::F32).elem_size(), 8);
        assert_eq!(DType::new(ElemKind::F64).with_dimension(4).size(), 32);
        assert_eq!(DType::complex(ElemKind::I16).with_dimension(2).size(), 8);
    }

    #[test]
    fn display_names_are_stable() {
        assert_eq!(DType::new(ElemKind::F32).to_string(), "f32");
        assert_eq!(DType::complex(ElemKind::F32).to_string(), "complex_f32");
        assert_eq!(
            DType::new(ElemKind::I16).with_dimension(4).to_string(),
            "i16[4]"
        );
    }

    #[test]
    fn serde_round_trip() {
        let dtype = DType::complex(ElemKind::I16).with_dimension(3);
        let json = serde_json::to_string(&dtype).expect("serialize dtype");
        let back: DType = serde_json::from_str(&json).expect("deserialize dtype");
        assert_eq!(dtype, back);
    }

    #[test]
    fn parse_round_trips_display_names() {
        for dtype in [
            DType::new(ElemKind::U8),
            DType::complex(ElemKind::F32),
            DType::new(ElemKind::I16).with_dimension(4),
            DType::complex(ElemKind::F64).with_dimension(2),
        ] {
            let parsed: DType = dtype.to_string().parse().expect("parse dtype name");
            assert_eq!(parsed, dtype);
        }
    }

    #[test]
    fn parse_rejects_unknown_names() {
        assert!("float128".parse::<DType>().is_err());
        assert!("u8[0]".parse::<DType>().is_err());
        assert!("u8[4".parse::<DType>().is_err());
    }
}
