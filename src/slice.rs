//! Module handling lazy loading via iterating on slices on the original buffer.
use crate::lib::Vec;
use crate::tensor::TensorView;
use core::fmt::Display;
use core::ops::{Bound, Range, RangeFrom, RangeFull, RangeInclusive, RangeTo, RangeToInclusive};

/// Error representing invalid slicing attempt
#[derive(Debug)]
#[cfg_attr(test, derive(Eq, PartialEq))]
pub enum InvalidSlice {
    /// When the client asked for more slices than the tensors has dimensions
    TooManySlices,
    /// When the client asked for a slice that exceeds the allowed bounds
    SliceOutOfRange {
        /// The rank of the dimension that has the out of bounds
        dim_index: usize,
        /// The problematic value
        asked: usize,
        /// The dimension size we shouldn't go over.
        dim_size: usize,
    },
}

impl Display for InvalidSlice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match *self {
            InvalidSlice::TooManySlices => {
                write!(f, "more slicing indexes than dimensions in tensor")
            }
            InvalidSlice::SliceOutOfRange {
                dim_index,
                asked,
                dim_size,
            } => {
                write!(
                    f,
                    "index {asked} out of bounds for tensor dimension #{dim_index} of size {dim_size}"
                )
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for InvalidSlice {}

#[cfg(not(feature = "std"))]
impl core::error::Error for InvalidSlice {}

/// One slicing operation along a single dimension: keep one index or
/// narrow to a sub-range.
#[derive(Debug, Clone)]
pub enum TensorIndexer {
    /// Keep only the element at this index along the dimension.
    Select(usize),
    /// Keep the elements between these bounds along the dimension.
    Narrow(Bound<usize>, Bound<usize>),
}

impl From<usize> for TensorIndexer {
    fn from(index: usize) -> Self {
        TensorIndexer::Select(index)
    }
}

impl From<RangeFull> for TensorIndexer {
    fn from(_: RangeFull) -> Self {
        TensorIndexer::Narrow(Bound::Unbounded, Bound::Unbounded)
    }
}

impl From<Range<usize>> for TensorIndexer {
    fn from(range: Range<usize>) -> Self {
        TensorIndexer::Narrow(Bound::Included(range.start), Bound::Excluded(range.end))
    }
}

impl From<RangeInclusive<usize>> for TensorIndexer {
    fn from(range: RangeInclusive<usize>) -> Self {
        TensorIndexer::Narrow(
            Bound::Included(*range.start()),
            Bound::Included(*range.end()),
        )
    }
}

impl From<RangeFrom<usize>> for TensorIndexer {
    fn from(range: RangeFrom<usize>) -> Self {
        TensorIndexer::Narrow(Bound::Included(range.start), Bound::Unbounded)
    }
}

impl From<RangeTo<usize>> for TensorIndexer {
    fn from(range: RangeTo<usize>) -> Self {
        TensorIndexer::Narrow(Bound::Unbounded, Bound::Excluded(range.end))
    }
}

impl From<RangeToInclusive<usize>> for TensorIndexer {
    fn from(range: RangeToInclusive<usize>) -> Self {
        TensorIndexer::Narrow(Bound::Unbounded, Bound::Included(range.end))
    }
}

/// Resolves one indexer against a dimension into a concrete index range.
fn resolve(
    indexer: &TensorIndexer,
    dim_index: usize,
    dim_size: usize,
) -> Result<Range<usize>, InvalidSlice> {
    let out_of_range = |asked| InvalidSlice::SliceOutOfRange {
        dim_index,
        asked,
        dim_size,
    };
    match indexer {
        TensorIndexer::Select(index) => {
            if *index >= dim_size {
                Err(out_of_range(*index))
            } else {
                Ok(*index..*index + 1)
            }
        }
        TensorIndexer::Narrow(start, stop) => {
            let start = match start {
                Bound::Included(s) => *s,
                Bound::Excluded(s) => s.checked_add(1).ok_or_else(|| out_of_range(*s))?,
                Bound::Unbounded => 0,
            };
            let stop = match stop {
                Bound::Included(e) => e.checked_add(1).ok_or_else(|| out_of_range(*e))?,
                Bound::Excluded(e) => *e,
                Bound::Unbounded => dim_size,
            };
            if stop > dim_size {
                Err(out_of_range(stop))
            } else if start > stop {
                Err(out_of_range(start))
            } else {
                Ok(start..stop)
            }
        }
    }
}

/// Iterator over the contiguous byte runs of a sliced tensor.
///
/// Trailing dimensions the slice covers completely are folded into a
/// single run together with the innermost narrowed dimension, so a slice
/// that keeps whole rows comes back one row per chunk rather than one
/// element at a time.
#[derive(Debug)]
pub struct SliceIterator<'data> {
    data: &'data [u8],
    /// Selected index ranges of the dimensions outside the chunk.
    outer: Vec<Range<usize>>,
    /// Byte stride of each outer dimension.
    strides: Vec<usize>,
    /// Odometer over `outer`.
    cursor: Vec<usize>,
    /// Chunks still to yield.
    remaining: usize,
    /// Byte offset of the chunk within one position of the outer dims.
    chunk_offset: usize,
    chunk_len: usize,
    newshape: Vec<usize>,
}

impl<'data> SliceIterator<'data> {
    /// Creates a new SliceIterator
    /// This should be used internally by tensor only
    pub fn new(
        tensor: &'data TensorView<'data>,
        slices: &[TensorIndexer],
    ) -> Result<Self, InvalidSlice> {
        let shape = tensor.shape();
        if slices.len() > shape.len() {
            return Err(InvalidSlice::TooManySlices);
        }

        let full = TensorIndexer::Narrow(Bound::Unbounded, Bound::Unbounded);
        let mut ranges = Vec::with_capacity(shape.len());
        for (dim_index, &dim_size) in shape.iter().enumerate() {
            let indexer = slices.get(dim_index).unwrap_or(&full);
            ranges.push(resolve(indexer, dim_index, dim_size)?);
        }
        let newshape: Vec<usize> = ranges.iter().map(|r| r.end - r.start).collect();

        let element_size = tensor.dtype().size();
        // Walk inward over the dimensions the slice covers completely;
        // they belong to the chunk, not to the odometer.
        let mut split = shape.len();
        while split > 0 && ranges[split - 1] == (0..shape[split - 1]) {
            split -= 1;
        }

        // All byte math saturates: a corrupt directory can describe far
        // more bytes than the buffer holds, and the bounds check in
        // `next` turns a saturated offset into the end of iteration.
        let byte_len =
            |dims: &[usize]| dims.iter().fold(element_size, |acc, &d| acc.saturating_mul(d));
        let (outer, chunk_offset, chunk_len) = if split == 0 {
            (Vec::new(), 0, byte_len(shape))
        } else {
            let inner = byte_len(&shape[split..]);
            let innermost = ranges[split - 1].clone();
            (
                ranges[..split - 1].to_vec(),
                innermost.start.saturating_mul(inner),
                (innermost.end - innermost.start).saturating_mul(inner),
            )
        };

        let strides: Vec<usize> = (0..outer.len()).map(|i| byte_len(&shape[i + 1..])).collect();

        let remaining = if chunk_len == 0 {
            0
        } else {
            outer
                .iter()
                .map(|r| r.end - r.start)
                .fold(1usize, usize::saturating_mul)
        };
        let cursor = outer.iter().map(|r| r.start).collect();

        Ok(Self {
            data: tensor.data(),
            outer,
            strides,
            cursor,
            remaining,
            chunk_offset,
            chunk_len,
            newshape,
        })
    }

    /// The shape of the sliced view, one extent per original dimension.
    pub fn newshape(&self) -> &[usize] {
        &self.newshape
    }

    /// Total bytes left to yield.
    pub fn remaining_byte_len(&self) -> usize {
        self.remaining.saturating_mul(self.chunk_len)
    }
}

impl<'data> Iterator for SliceIterator<'data> {
    type Item = &'data [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let mut start = self.chunk_offset;
        for (position, stride) in self.cursor.iter().zip(&self.strides) {
            start = start.saturating_add(position.saturating_mul(*stride));
        }
        // Advance the odometer, innermost outer dimension first.
        for i in (0..self.cursor.len()).rev() {
            self.cursor[i] += 1;
            if self.cursor[i] < self.outer[i].end {
                break;
            }
            self.cursor[i] = self.outer[i].start;
        }
        self.remaining -= 1;
        // A view built from a corrupt directory can be shorter than its
        // shape implies; end the iteration rather than panic.
        self.data.get(start..start.saturating_add(self.chunk_len))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Dtype;

    fn bytes(n: usize) -> Vec<u8> {
        (0..n as u8).collect()
    }

    #[test]
    fn select_keeps_a_contiguous_block() {
        let data = bytes(24);
        let tensor = TensorView::new(Dtype::U8, vec![2, 3, 4], &data).unwrap();
        let mut iter = tensor.sliced_data(&[1usize.into()]).unwrap();
        assert_eq!(iter.newshape(), [1, 3, 4]);
        assert_eq!(iter.remaining_byte_len(), 12);
        assert_eq!(iter.next(), Some(&data[12..24]));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn narrow_on_a_middle_dimension() {
        let data = bytes(24);
        let tensor = TensorView::new(Dtype::U8, vec![2, 3, 4], &data).unwrap();
        let slices = [TensorIndexer::from(0..2), TensorIndexer::from(1..3)];
        let chunks: Vec<_> = tensor.sliced_data(&slices).unwrap().collect();
        assert_eq!(chunks, [&data[4..12], &data[16..24]]);
    }

    #[test]
    fn innermost_selection_yields_single_elements() {
        let data = bytes(24);
        let tensor = TensorView::new(Dtype::U8, vec![2, 3, 4], &data).unwrap();
        let slices = [
            TensorIndexer::from(0usize),
            TensorIndexer::from(1..2),
            TensorIndexer::from(2usize),
        ];
        let chunks: Vec<_> = tensor.sliced_data(&slices).unwrap().collect();
        assert_eq!(chunks, [&data[6..7]]);
    }

    #[test]
    fn element_size_scales_the_chunks() {
        let data: Vec<u8> = (0..4u32).flat_map(|v| v.to_le_bytes()).collect();
        let tensor = TensorView::new(Dtype::U32, vec![2, 2], &data).unwrap();
        let chunks: Vec<_> = tensor.sliced_data(&[1usize.into()]).unwrap().collect();
        assert_eq!(chunks, [&data[8..16]]);
    }

    #[test]
    fn full_and_unbounded_ranges() {
        let data = bytes(24);
        let tensor = TensorView::new(Dtype::U8, vec![2, 3, 4], &data).unwrap();
        let slices = [TensorIndexer::from(..), TensorIndexer::from(2..)];
        let chunks: Vec<_> = tensor.sliced_data(&slices).unwrap().collect();
        assert_eq!(chunks, [&data[8..12], &data[20..24]]);
        let slices = [TensorIndexer::from(..=0)];
        let chunks: Vec<_> = tensor.sliced_data(&slices).unwrap().collect();
        assert_eq!(chunks, [&data[..12]]);
    }

    #[test]
    fn scalar_views_slice_to_themselves() {
        let data = 1.0f32.to_le_bytes();
        let tensor = TensorView::new(Dtype::F32, vec![], &data).unwrap();
        let chunks: Vec<_> = tensor.sliced_data(&[]).unwrap().collect();
        assert_eq!(chunks, [&data[..]]);
    }

    #[test]
    fn empty_ranges_yield_nothing() {
        let data = bytes(24);
        let tensor = TensorView::new(Dtype::U8, vec![2, 3, 4], &data).unwrap();
        let mut iter = tensor.sliced_data(&[TensorIndexer::from(1..1)]).unwrap();
        assert_eq!(iter.newshape(), [0, 3, 4]);
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn out_of_bounds_is_reported() {
        let data = bytes(24);
        let tensor = TensorView::new(Dtype::U8, vec![2, 3, 4], &data).unwrap();
        let result = tensor.sliced_data(&[TensorIndexer::from(5usize)]);
        assert_eq!(
            result.unwrap_err(),
            InvalidSlice::SliceOutOfRange {
                dim_index: 0,
                asked: 5,
                dim_size: 2,
            }
        );
        let result = tensor.sliced_data(&[TensorIndexer::from(0..3)]);
        assert_eq!(
            result.unwrap_err(),
            InvalidSlice::SliceOutOfRange {
                dim_index: 0,
                asked: 3,
                dim_size: 2,
            }
        );
    }

    #[test]
    fn too_many_slices_is_reported() {
        let data = bytes(4);
        let tensor = TensorView::new(Dtype::U8, vec![4], &data).unwrap();
        let slices = [TensorIndexer::from(0usize), TensorIndexer::from(0usize)];
        assert_eq!(
            tensor.sliced_data(&slices).unwrap_err(),
            InvalidSlice::TooManySlices
        );
    }
}
