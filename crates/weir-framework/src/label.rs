//! Out-of-band stream markers.
//!
//! A label rides alongside stream data at an absolute element index and
//! spans `width` elements. Producers post labels relative to the region
//! being produced; the output port rebases them onto the stream's absolute
//! element counter before dispatch.

use std::fmt;

use crate::arg::Arg;

#[derive(Clone)]
pub struct Label {
    pub id: String,
    pub data: Arg,
    /// Absolute element index within the stream once posted.
    pub index: u64,
    /// Number of elements the label spans.
    pub width: usize,
}

impl Label {
    pub fn new(id: impl Into<String>, data: Arg, index: u64) -> Self {
        Self {
            id: id.into(),
            data,
            index,
            width: 1,
        }
    }

    pub fn with_width(mut self, width: usize) -> Self {
        self.width = width.max(1);
        self
    }

    /// The same label rebased to another index, used when a stream's
    /// element rate changes across a block.
    pub(crate) fn at_index(&self, index: u64) -> Label {
        let mut label = self.clone();
        label.index = index;
        label
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Label")
            .field("id", &self.id)
            .field("index", &self.index)
            .field("width", &self.width)
            .finish()
    }
}
