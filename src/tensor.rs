//! The tensor directory of an archive: element types, per-tensor
//! descriptors, the header validator that builds the directory out of the
//! parsed JSON tree, and the on-demand offset check.

use crate::json::{JsonError, Value};
use crate::lib::{HashMap, String, ToString, Vec};
use crate::slice::{InvalidSlice, SliceIterator, TensorIndexer};
use core::fmt::Display;
use core::str::{FromStr, Utf8Error};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// Tensors with more dimensions than this are rejected.
pub const MAX_DIM: usize = 8;

/// Headers larger than this are rejected before parsing, bounding the
/// memory an untrusted file can make the reader allocate.
pub const MAX_HEADER_SIZE: usize = 100_000_000;

/// Possible errors that could occur while reading or writing an archive.
#[derive(Debug)]
pub enum TensorFileError {
    /// The buffer is too small to hold the length prefix and a header.
    HeaderTooSmall,
    /// The header is larger than 100MB which is considered too large.
    HeaderTooLarge,
    /// The length prefix is under the minimal header size or points past
    /// the end of the buffer.
    InvalidHeaderLength,
    /// The header is an invalid UTF-8 string and cannot be read.
    InvalidHeader(Utf8Error),
    /// The header does contain a valid string, but it is not valid JSON.
    InvalidHeaderDeserialization(JsonError),
    /// The header root, or a tensor entry, is not a JSON object.
    NotAnObject,
    /// A tensor was declared under an empty name.
    EmptyTensorName,
    /// A required field is missing on the named tensor.
    MissingField(String, &'static str),
    /// A field on the named tensor has the wrong JSON type or a value
    /// that is not a non-negative integer where one is required.
    InvalidField(String, &'static str),
    /// The dtype string is not one of the supported element types.
    UnknownDtype(String),
    /// The named tensor has more than [`MAX_DIM`] dimensions.
    TooManyDims(String),
    /// The offsets declared for tensor with name `String` in the header
    /// are reversed, or present on an empty tensor.
    InvalidOffset(String),
    /// Two tensors share a name.
    DuplicateTensor(String),
    /// The same metadata key appears twice.
    DuplicateMetadataKey(String),
    /// A `__metadata__` value is not a string.
    MetadataNotString(String),
    /// The named tensor's offsets disagree with its shape and dtype, or
    /// fall outside the payload.
    TensorInvalidInfo(String),
    /// The shape or shape * dtype size leads to an arithmetic overflow.
    /// This is most likely an error in the file.
    ValidationOverflow,
    /// The tensor cannot be created because the buffer size doesn't match
    /// shape + dtype.
    InvalidTensorView(Dtype, Vec<usize>, usize),
    /// The header could not be re-serialized.
    HeaderSerialization(serde_json::Error),
    /// IoError
    #[cfg(feature = "std")]
    IoError(std::io::Error),
}

#[cfg(feature = "std")]
impl From<std::io::Error> for TensorFileError {
    fn from(error: std::io::Error) -> TensorFileError {
        TensorFileError::IoError(error)
    }
}

impl From<JsonError> for TensorFileError {
    fn from(error: JsonError) -> TensorFileError {
        TensorFileError::InvalidHeaderDeserialization(error)
    }
}

impl From<serde_json::Error> for TensorFileError {
    fn from(error: serde_json::Error) -> TensorFileError {
        TensorFileError::HeaderSerialization(error)
    }
}

impl Display for TensorFileError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        use TensorFileError::*;

        match self {
            HeaderTooSmall => write!(f, "header too small"),
            HeaderTooLarge => write!(f, "header too large"),
            InvalidHeaderLength => write!(f, "invalid header length"),
            InvalidHeader(error) => write!(f, "invalid UTF-8 in header: {error}"),
            InvalidHeaderDeserialization(error) => write!(f, "invalid JSON in header: {error}"),
            NotAnObject => write!(f, "expected a JSON object"),
            EmptyTensorName => write!(f, "tensor declared under an empty name"),
            MissingField(name, field) => {
                write!(f, "missing field `{field}` on tensor `{name}`")
            }
            InvalidField(name, field) => {
                write!(f, "invalid field `{field}` on tensor `{name}`")
            }
            UnknownDtype(dtype) => write!(f, "unknown dtype `{dtype}`"),
            TooManyDims(name) => {
                write!(f, "tensor `{name}` has more than {MAX_DIM} dimensions")
            }
            InvalidOffset(name) => write!(f, "invalid offset for tensor `{name}`"),
            DuplicateTensor(name) => write!(f, "duplicate tensor `{name}`"),
            DuplicateMetadataKey(key) => write!(f, "duplicate metadata key `{key}`"),
            MetadataNotString(key) => {
                write!(f, "metadata value for `{key}` is not a string")
            }
            TensorInvalidInfo(name) => {
                write!(f, "invalid shape, data type, or offset for tensor `{name}`")
            }
            ValidationOverflow => {
                write!(
                    f,
                    "overflow computing buffer size from shape and/or element type"
                )
            }
            InvalidTensorView(dtype, shape, n_bytes) => {
                write!(f, "tensor of type {dtype} and shape (")?;
                for (i, &dim) in shape.iter().enumerate() {
                    write!(f, "{sep}{dim}", sep = if i == 0 { "" } else { ", " })?;
                }
                write!(f, ") can't be created from {n_bytes} bytes")
            }
            HeaderSerialization(error) => write!(f, "cannot serialize header: {error}"),
            #[cfg(feature = "std")]
            IoError(error) => write!(f, "I/O error: {error}"),
        }
    }
}

#[cfg(not(feature = "std"))]
impl core::error::Error for TensorFileError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            TensorFileError::InvalidHeader(source) => Some(source),
            TensorFileError::InvalidHeaderDeserialization(source) => Some(source),
            TensorFileError::HeaderSerialization(source) => Some(source),
            _ => None,
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TensorFileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TensorFileError::InvalidHeader(source) => Some(source),
            TensorFileError::InvalidHeaderDeserialization(source) => Some(source),
            TensorFileError::HeaderSerialization(source) => Some(source),
            TensorFileError::IoError(source) => Some(source),
            _ => None,
        }
    }
}

/// The various available dtypes. Element sizes are fixed per dtype.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[non_exhaustive]
#[allow(non_camel_case_types)]
pub enum Dtype {
    /// Boolean type
    BOOL,
    /// Unsigned byte
    U8,
    /// Signed byte
    I8,
    /// Unsigned integer (16-bit)
    U16,
    /// Signed integer (16-bit)
    I16,
    /// Half-precision floating point
    F16,
    /// Brain floating point
    BF16,
    /// Unsigned integer (32-bit)
    U32,
    /// Signed integer (32-bit)
    I32,
    /// Floating point (32-bit)
    F32,
    /// Floating point (64-bit)
    F64,
    /// Unsigned integer (64-bit)
    U64,
    /// Signed integer (64-bit)
    I64,
}

impl Dtype {
    /// Gives out the size (in bytes) of 1 element of this dtype.
    pub fn size(&self) -> usize {
        match self {
            Dtype::BOOL => 1,
            Dtype::U8 => 1,
            Dtype::I8 => 1,
            Dtype::U16 => 2,
            Dtype::I16 => 2,
            Dtype::F16 => 2,
            Dtype::BF16 => 2,
            Dtype::U32 => 4,
            Dtype::I32 => 4,
            Dtype::F32 => 4,
            Dtype::F64 => 8,
            Dtype::U64 => 8,
            Dtype::I64 => 8,
        }
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match *self {
            Dtype::BOOL => "BOOL",
            Dtype::U8 => "U8",
            Dtype::I8 => "I8",
            Dtype::U16 => "U16",
            Dtype::I16 => "I16",
            Dtype::F16 => "F16",
            Dtype::BF16 => "BF16",
            Dtype::U32 => "U32",
            Dtype::I32 => "I32",
            Dtype::F32 => "F32",
            Dtype::F64 => "F64",
            Dtype::U64 => "U64",
            Dtype::I64 => "I64",
        })
    }
}

impl FromStr for Dtype {
    type Err = TensorFileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BOOL" => Ok(Dtype::BOOL),
            "U8" => Ok(Dtype::U8),
            "I8" => Ok(Dtype::I8),
            "U16" => Ok(Dtype::U16),
            "I16" => Ok(Dtype::I16),
            "F16" => Ok(Dtype::F16),
            "BF16" => Ok(Dtype::BF16),
            "U32" => Ok(Dtype::U32),
            "I32" => Ok(Dtype::I32),
            "F32" => Ok(Dtype::F32),
            "F64" => Ok(Dtype::F64),
            "U64" => Ok(Dtype::U64),
            "I64" => Ok(Dtype::I64),
            _ => Err(TensorFileError::UnknownDtype(s.to_string())),
        }
    }
}

/// A single tensor information.
/// Endianness is assumed to be little endian
/// Ordering is assumed to be 'C'.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    /// The type of each element of the tensor
    pub dtype: Dtype,
    /// The shape of the tensor
    pub shape: Vec<usize>,
    /// The offsets to find the data within the byte-buffer array,
    /// relative to the start of the payload region. `(0, 0)` for empty
    /// tensors, which carry no payload bytes.
    pub data_offsets: (usize, usize),
}

impl TensorInfo {
    /// Whether any dimension is zero, making the tensor hold no elements.
    pub fn is_empty(&self) -> bool {
        self.shape.contains(&0)
    }

    /// Number of elements: 1 for a scalar (rank 0), 0 when any dimension
    /// is zero, otherwise the product of the dimensions. `None` when the
    /// product overflows.
    pub fn element_count(&self) -> Option<usize> {
        self.shape.iter().copied().try_fold(1usize, usize::checked_mul)
    }

    /// Total payload bytes the tensor occupies, or `None` on overflow.
    pub fn byte_size(&self) -> Option<usize> {
        self.element_count()?.checked_mul(self.dtype.size())
    }
}

impl Serialize for TensorInfo {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // Empty tensors must not carry offsets on the wire; the field is
        // forbidden for them, not merely redundant.
        let fields = if self.is_empty() { 2 } else { 3 };
        let mut map = serializer.serialize_map(Some(fields))?;
        map.serialize_entry("dtype", &self.dtype)?;
        map.serialize_entry("shape", &self.shape)?;
        if !self.is_empty() {
            map.serialize_entry(
                "data_offsets",
                &[self.data_offsets.0, self.data_offsets.1],
            )?;
        }
        map.end()
    }
}

/// The struct representing the header of an archive, which allows indexing
/// into the raw byte-buffer and says how to interpret it.
#[derive(Debug, Clone)]
pub struct Metadata {
    metadata: Vec<(String, String)>,
    tensors: Vec<(String, TensorInfo)>,
    index_map: HashMap<String, usize>,
    warnings: Vec<String>,
}

impl Metadata {
    /// Creates a new metadata structure.
    ///
    /// Fails when a tensor name or metadata key repeats, a name is empty,
    /// a shape has too many dimensions, or offsets are reversed or present
    /// on an empty tensor.
    pub fn new(
        metadata: Vec<(String, String)>,
        tensors: Vec<(String, TensorInfo)>,
    ) -> Result<Self, TensorFileError> {
        let mut index_map = HashMap::with_capacity(tensors.len());
        for (index, (name, info)) in tensors.iter().enumerate() {
            if name.is_empty() {
                return Err(TensorFileError::EmptyTensorName);
            }
            if info.shape.len() > MAX_DIM {
                return Err(TensorFileError::TooManyDims(name.clone()));
            }
            let (start, end) = info.data_offsets;
            if start > end || (info.is_empty() && (start, end) != (0, 0)) {
                return Err(TensorFileError::InvalidOffset(name.clone()));
            }
            if index_map.insert(name.clone(), index).is_some() {
                return Err(TensorFileError::DuplicateTensor(name.clone()));
            }
        }
        for (index, (key, _)) in metadata.iter().enumerate() {
            if metadata[..index].iter().any(|(seen, _)| seen == key) {
                return Err(TensorFileError::DuplicateMetadataKey(key.clone()));
            }
        }
        Ok(Self {
            metadata,
            tensors,
            index_map,
            warnings: Vec::new(),
        })
    }

    /// Builds the tensor directory out of a parsed header tree.
    ///
    /// The root must be an object; `"__metadata__"` becomes the string
    /// pairs, every other entry a tensor. Entry order is preserved.
    pub(crate) fn from_header(root: Value) -> Result<Self, TensorFileError> {
        let Value::Object(entries) = root else {
            return Err(TensorFileError::NotAnObject);
        };
        let mut metadata = Vec::new();
        let mut tensors = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            if key == "__metadata__" {
                let Value::Object(pairs) = value else {
                    return Err(TensorFileError::NotAnObject);
                };
                for (k, v) in pairs {
                    let Value::String(s) = v else {
                        return Err(TensorFileError::MetadataNotString(k));
                    };
                    metadata.push((k, s));
                }
            } else {
                let info = tensor_from_value(&key, value)?;
                tensors.push((key, info));
            }
        }
        // `new` re-asserts name uniqueness even though the JSON grammar
        // already rejects duplicate keys.
        Metadata::new(metadata, tensors)
    }

    /// The separate offsets pass: every non-empty tensor's span must lie
    /// within `payload_len` and match its `shape` x `dtype` byte size.
    ///
    /// Not run during load, so archives with corrupt offsets stay open
    /// for inspection.
    pub fn validate_offsets(&self, payload_len: usize) -> Result<(), TensorFileError> {
        for (name, info) in &self.tensors {
            let size = info
                .byte_size()
                .ok_or(TensorFileError::ValidationOverflow)?;
            if size == 0 {
                continue;
            }
            let (start, end) = info.data_offsets;
            if start > end || end > payload_len || end - start != size {
                return Err(TensorFileError::TensorInvalidInfo(name.clone()));
            }
        }
        Ok(())
    }

    /// Gives back the tensor metadata
    pub fn info(&self, name: &str) -> Option<&TensorInfo> {
        let &index = self.index_map.get(name)?;
        Some(&self.tensors[index].1)
    }

    /// The position of `name` in the header, if present.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index_map.get(name).copied()
    }

    /// The name and descriptor at `index`, in header order.
    pub fn get(&self, index: usize) -> Option<(&str, &TensorInfo)> {
        self.tensors
            .get(index)
            .map(|(name, info)| (name.as_str(), info))
    }

    /// Iterates over `(name, descriptor)` pairs in header order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TensorInfo)> {
        self.tensors.iter().map(|(name, info)| (name.as_str(), info))
    }

    /// Return the names of the tensors, in header order.
    pub fn names(&self) -> Vec<&str> {
        self.tensors.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Return how many tensors are currently stored.
    #[inline]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Indicate if there are any tensors at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// The free-form string pairs of the header's `"__metadata__"` entry,
    /// in header order.
    pub fn metadata(&self) -> &[(String, String)] {
        &self.metadata
    }

    /// Looks up one metadata value by key.
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Non-fatal notes collected while reading the header. Nothing fills
    /// this today (unknown tensor fields are ignored silently); the slot
    /// exists so diagnostics can be surfaced without an API break.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

impl Serialize for Metadata {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let extra = usize::from(!self.metadata.is_empty());
        let mut map = serializer.serialize_map(Some(self.tensors.len() + extra))?;
        if !self.metadata.is_empty() {
            map.serialize_entry("__metadata__", &StringPairs(&self.metadata))?;
        }
        for (name, info) in &self.tensors {
            map.serialize_entry(name, info)?;
        }
        map.end()
    }
}

/// Serializes ordered `(key, value)` pairs as a JSON object.
struct StringPairs<'a>(&'a [(String, String)]);

impl Serialize for StringPairs<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Shape and offset entries come out of the reader as doubles; they must
/// round-trip as exact non-negative integers below 2^53.
fn as_index(value: f64) -> Option<usize> {
    const MAX_SAFE: f64 = 9_007_199_254_740_992.0; // 2^53
    if !(value >= 0.0 && value < MAX_SAFE) {
        return None;
    }
    let n = value as u64;
    if n as f64 != value {
        return None;
    }
    usize::try_from(n).ok()
}

/// Validates one tensor entry of the header.
fn tensor_from_value(name: &str, value: Value) -> Result<TensorInfo, TensorFileError> {
    let bad = |field| TensorFileError::InvalidField(name.to_string(), field);
    let Value::Object(fields) = value else {
        return Err(TensorFileError::NotAnObject);
    };
    let mut dtype = None;
    let mut shape = None;
    let mut offsets = None;
    for (field, v) in fields {
        match field.as_str() {
            "dtype" => {
                let Value::String(s) = v else {
                    return Err(bad("dtype"));
                };
                dtype = Some(Dtype::from_str(&s)?);
            }
            "shape" => {
                let Value::Array(items) = v else {
                    return Err(bad("shape"));
                };
                if items.len() > MAX_DIM {
                    return Err(TensorFileError::TooManyDims(name.to_string()));
                }
                let mut dims = Vec::with_capacity(items.len());
                for item in items {
                    let dim = item.as_f64().and_then(as_index).ok_or_else(|| bad("shape"))?;
                    dims.push(dim);
                }
                shape = Some(dims);
            }
            "data_offsets" => {
                let Value::Array(items) = v else {
                    return Err(bad("data_offsets"));
                };
                let [start, end] = items.as_slice() else {
                    return Err(bad("data_offsets"));
                };
                let start = start
                    .as_f64()
                    .and_then(as_index)
                    .ok_or_else(|| bad("data_offsets"))?;
                let end = end
                    .as_f64()
                    .and_then(as_index)
                    .ok_or_else(|| bad("data_offsets"))?;
                offsets = Some((start, end));
            }
            // Unknown fields are tolerated and ignored.
            _ => {}
        }
    }
    let dtype = dtype.ok_or_else(|| TensorFileError::MissingField(name.to_string(), "dtype"))?;
    let shape = shape.ok_or_else(|| TensorFileError::MissingField(name.to_string(), "shape"))?;
    let empty = shape.contains(&0);
    let data_offsets = match offsets {
        Some((start, end)) => {
            // Offsets are forbidden on empty tensors and must not be
            // reversed on anything else.
            if empty || start > end {
                return Err(TensorFileError::InvalidOffset(name.to_string()));
            }
            (start, end)
        }
        None if empty => (0, 0),
        None => {
            return Err(TensorFileError::MissingField(
                name.to_string(),
                "data_offsets",
            ))
        }
    };
    Ok(TensorInfo {
        dtype,
        shape,
        data_offsets,
    })
}

/// A view of a Tensor within an archive.
/// Contains references to data within the full byte-buffer
/// And is thus a readable view of a single tensor
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TensorView<'data> {
    dtype: Dtype,
    shape: Vec<usize>,
    data: &'data [u8],
}

impl<'data> TensorView<'data> {
    /// Create new tensor view checking that `data` holds exactly
    /// `shape` x `dtype` bytes.
    pub fn new(
        dtype: Dtype,
        shape: Vec<usize>,
        data: &'data [u8],
    ) -> Result<Self, TensorFileError> {
        let n_elements: usize = shape
            .iter()
            .copied()
            .try_fold(1usize, usize::checked_mul)
            .ok_or(TensorFileError::ValidationOverflow)?;
        let size = n_elements
            .checked_mul(dtype.size())
            .ok_or(TensorFileError::ValidationOverflow)?;
        if data.len() != size {
            Err(TensorFileError::InvalidTensorView(dtype, shape, data.len()))
        } else {
            Ok(Self { dtype, shape, data })
        }
    }

    /// Builds a view straight from a validated descriptor; bounds against
    /// the payload were already checked by the caller, the size match is
    /// deferred to the offsets pass.
    pub(crate) fn from_parts(dtype: Dtype, shape: Vec<usize>, data: &'data [u8]) -> Self {
        Self { dtype, shape, data }
    }

    /// The current tensor dtype
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// The current tensor shape
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// The current tensor byte-buffer
    pub fn data(&self) -> &'data [u8] {
        self.data
    }

    /// The various pieces of the data buffer according to the asked slice
    pub fn sliced_data(
        &'data self,
        slices: &[TensorIndexer],
    ) -> Result<SliceIterator<'data>, InvalidSlice> {
        SliceIterator::new(self, slices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(text: &str) -> Result<Metadata, TensorFileError> {
        Metadata::from_header(crate::json::from_str(text).unwrap())
    }

    #[test]
    fn dtype_sizes() {
        let sizes = [
            (Dtype::BOOL, 1),
            (Dtype::U8, 1),
            (Dtype::I8, 1),
            (Dtype::U16, 2),
            (Dtype::I16, 2),
            (Dtype::F16, 2),
            (Dtype::BF16, 2),
            (Dtype::U32, 4),
            (Dtype::I32, 4),
            (Dtype::F32, 4),
            (Dtype::F64, 8),
            (Dtype::U64, 8),
            (Dtype::I64, 8),
        ];
        for (dtype, size) in sizes {
            assert_eq!(dtype.size(), size);
            // The display form parses back to the same dtype.
            assert_eq!(Dtype::from_str(&dtype.to_string()).unwrap(), dtype);
        }
        assert!(matches!(
            Dtype::from_str("F8_E4M3"),
            Err(TensorFileError::UnknownDtype(_))
        ));
    }

    #[test]
    fn directory_from_header() {
        let metadata = header(
            r#"{"__metadata__":{"format":"pt"},"w":{"dtype":"F32","shape":[3,4],"data_offsets":[0,48]},"b":{"dtype":"F32","shape":[4],"data_offsets":[48,64]}}"#,
        )
        .unwrap();
        assert_eq!(metadata.names(), ["w", "b"]);
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata.metadata_value("format"), Some("pt"));
        assert_eq!(metadata.metadata_value("missing"), None);
        let info = metadata.info("b").unwrap();
        assert_eq!(info.dtype, Dtype::F32);
        assert_eq!(info.shape, [4]);
        assert_eq!(info.data_offsets, (48, 64));
        assert_eq!(info.element_count(), Some(4));
        assert_eq!(info.byte_size(), Some(16));
        assert!(metadata.warnings().is_empty());
    }

    #[test]
    fn scalar_tensor() {
        let metadata =
            header(r#"{"s":{"dtype":"F32","shape":[],"data_offsets":[0,4]}}"#).unwrap();
        let info = metadata.info("s").unwrap();
        assert_eq!(info.shape.len(), 0);
        assert_eq!(info.element_count(), Some(1));
        assert_eq!(info.byte_size(), Some(4));
    }

    #[test]
    fn empty_tensor_defaults_offsets() {
        let metadata = header(r#"{"e":{"dtype":"F32","shape":[0,10]}}"#).unwrap();
        let info = metadata.info("e").unwrap();
        assert_eq!(info.shape, [0, 10]);
        assert_eq!(info.element_count(), Some(0));
        assert_eq!(info.byte_size(), Some(0));
        assert_eq!(info.data_offsets, (0, 0));
    }

    #[test]
    fn empty_tensor_with_offsets_is_rejected() {
        let err =
            header(r#"{"e":{"dtype":"F32","shape":[0,10],"data_offsets":[0,0]}}"#).unwrap_err();
        assert!(matches!(err, TensorFileError::InvalidOffset(name) if name == "e"));
    }

    #[test]
    fn missing_fields_are_rejected() {
        assert!(matches!(
            header(r#"{"t":{"shape":[1],"data_offsets":[0,4]}}"#),
            Err(TensorFileError::MissingField(_, "dtype"))
        ));
        assert!(matches!(
            header(r#"{"t":{"dtype":"F32","data_offsets":[0,4]}}"#),
            Err(TensorFileError::MissingField(_, "shape"))
        ));
        assert!(matches!(
            header(r#"{"t":{"dtype":"F32","shape":[1]}}"#),
            Err(TensorFileError::MissingField(_, "data_offsets"))
        ));
    }

    #[test]
    fn bad_fields_are_rejected() {
        assert!(matches!(
            header(r#"{"t":{"dtype":"F99","shape":[1],"data_offsets":[0,4]}}"#),
            Err(TensorFileError::UnknownDtype(s)) if s == "F99"
        ));
        assert!(matches!(
            header(r#"{"t":{"dtype":"F32","shape":[1.5],"data_offsets":[0,4]}}"#),
            Err(TensorFileError::InvalidField(_, "shape"))
        ));
        assert!(matches!(
            header(r#"{"t":{"dtype":"F32","shape":[-1],"data_offsets":[0,4]}}"#),
            Err(TensorFileError::InvalidField(_, "shape"))
        ));
        assert!(matches!(
            header(r#"{"t":{"dtype":"F32","shape":[1],"data_offsets":[0,4,8]}}"#),
            Err(TensorFileError::InvalidField(_, "data_offsets"))
        ));
        assert!(matches!(
            header(r#"{"t":{"dtype":"F32","shape":[1],"data_offsets":[8,4]}}"#),
            Err(TensorFileError::InvalidOffset(_))
        ));
        assert!(matches!(
            header(r#"{"t":{"dtype":"F32","shape":[1,1,1,1,1,1,1,1,1],"data_offsets":[0,4]}}"#),
            Err(TensorFileError::TooManyDims(_))
        ));
        assert!(matches!(
            header(r#"{"t":{"dtype":"F32","shape":[9007199254740992],"data_offsets":[0,4]}}"#),
            Err(TensorFileError::InvalidField(_, "shape"))
        ));
        assert!(matches!(
            header(r#"{"t":[1,2]}"#),
            Err(TensorFileError::NotAnObject)
        ));
        assert!(matches!(
            header(r#"{"":{"dtype":"F32","shape":[1],"data_offsets":[0,4]}}"#),
            Err(TensorFileError::EmptyTensorName)
        ));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let metadata = header(
            r#"{"t":{"dtype":"F32","shape":[1],"data_offsets":[0,4],"extra":"stuff"}}"#,
        )
        .unwrap();
        assert_eq!(metadata.info("t").unwrap().shape, [1]);
    }

    #[test]
    fn metadata_values_must_be_strings() {
        assert!(matches!(
            header(r#"{"__metadata__":{"k":7}}"#),
            Err(TensorFileError::MetadataNotString(k)) if k == "k"
        ));
    }

    #[test]
    fn offsets_pass() {
        let metadata = header(
            r#"{"a":{"dtype":"F32","shape":[4],"data_offsets":[0,16]},"e":{"dtype":"F32","shape":[0]}}"#,
        )
        .unwrap();
        metadata.validate_offsets(16).unwrap();
        // Payload shorter than the declared end.
        assert!(matches!(
            metadata.validate_offsets(8),
            Err(TensorFileError::TensorInvalidInfo(name)) if name == "a"
        ));
        // Span size disagreeing with shape x dtype.
        let metadata =
            header(r#"{"a":{"dtype":"F32","shape":[4],"data_offsets":[0,8]}}"#).unwrap();
        assert!(metadata.validate_offsets(16).is_err());
    }

    #[test]
    fn duplicate_names_are_rejected_by_new() {
        let info = TensorInfo {
            dtype: Dtype::U8,
            shape: vec![2],
            data_offsets: (0, 2),
        };
        let err = Metadata::new(
            Vec::new(),
            vec![("t".to_string(), info.clone()), ("t".to_string(), info)],
        )
        .unwrap_err();
        assert!(matches!(err, TensorFileError::DuplicateTensor(_)));
        let err = Metadata::new(
            vec![
                ("k".to_string(), "a".to_string()),
                ("k".to_string(), "b".to_string()),
            ],
            Vec::new(),
        )
        .unwrap_err();
        assert!(matches!(err, TensorFileError::DuplicateMetadataKey(_)));
    }

    #[test]
    fn tensor_view_checks_its_buffer() {
        let data = [0u8; 16];
        assert!(TensorView::new(Dtype::F32, vec![2, 2], &data).is_ok());
        assert!(matches!(
            TensorView::new(Dtype::F32, vec![2, 3], &data),
            Err(TensorFileError::InvalidTensorView(Dtype::F32, _, 16))
        ));
    }
}
