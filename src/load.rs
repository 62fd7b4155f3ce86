//! Loading archives out of byte buffers and files.
//!
//! [`TensorBuffer`] parses a caller-provided buffer and borrows it, which
//! is the zero-copy path for callers that already hold the bytes (or a
//! mapping of them). [`TensorFile`] owns its payload, either as a heap
//! copy or as a read-only mapping of the file.
//!
//! Loading validates the container structure and the header, but not the
//! tensor offsets against the payload; that is the separate
//! `validate_data_offsets` pass, so archives with corrupt offsets can
//! still be opened and inspected.

use crate::json;
use crate::lib::{String, ToString, Vec};
use crate::tensor::{Metadata, TensorFileError, TensorView, MAX_HEADER_SIZE};

pub(crate) const N_LEN: usize = size_of::<u64>();
/// The prefix plus a minimal space-padded header.
const MIN_FILE_SIZE: usize = 16;

/// Runs the shared container procedure over `buffer`: split off the
/// length prefix, bound the header, parse and validate it.
fn read_header(buffer: &[u8]) -> Result<(usize, Metadata), TensorFileError> {
    if buffer.len() < MIN_FILE_SIZE {
        return Err(TensorFileError::HeaderTooSmall);
    }
    let mut prefix = [0u8; N_LEN];
    prefix.copy_from_slice(&buffer[..N_LEN]);
    let n: usize = u64::from_le_bytes(prefix)
        .try_into()
        .map_err(|_| TensorFileError::HeaderTooLarge)?;
    // The size caps come before any work proportional to `n`.
    if n > MAX_HEADER_SIZE {
        return Err(TensorFileError::HeaderTooLarge);
    }
    if n < 2 {
        return Err(TensorFileError::InvalidHeaderLength);
    }
    let stop = n
        .checked_add(N_LEN)
        .ok_or(TensorFileError::InvalidHeaderLength)?;
    let Some(header_bytes) = buffer.get(N_LEN..stop) else {
        return Err(TensorFileError::InvalidHeaderLength);
    };
    let text = core::str::from_utf8(header_bytes).map_err(TensorFileError::InvalidHeader)?;
    let root = json::from_str(text)?;
    let metadata = Metadata::from_header(root)?;
    Ok((n, metadata))
}

/// Builds the view for the directory entry at `index`, if its recorded
/// span lies within the payload.
fn view_of<'m, 'd>(
    metadata: &'m Metadata,
    data: &'d [u8],
    index: usize,
) -> Option<(&'m str, TensorView<'d>)> {
    let (name, info) = metadata.get(index)?;
    let (start, end) = info.data_offsets;
    let bytes = data.get(start..end)?;
    Some((
        name,
        TensorView::from_parts(info.dtype, info.shape.clone(), bytes),
    ))
}

/// A structure owning some metadata to lookup tensors on a shared `data`
/// byte-buffer (not owned).
#[derive(Debug)]
pub struct TensorBuffer<'data> {
    header_size: usize,
    metadata: Metadata,
    data: &'data [u8],
}

impl<'data> TensorBuffer<'data> {
    /// Given a byte-buffer representing the whole archive, parses the
    /// header and returns the size of the header + the parsed data.
    pub fn read_metadata(buffer: &[u8]) -> Result<(usize, Metadata), TensorFileError> {
        read_header(buffer)
    }

    /// Given a byte-buffer representing the whole archive, parses it and
    /// returns the deserialized form (no tensor allocation, no copy).
    ///
    /// ```
    /// use tensorfile::TensorBuffer;
    ///
    /// let serialized = b"<\x00\x00\x00\x00\x00\x00\x00{\"test\":{\"dtype\":\"I32\",\"shape\":[2,2],\"data_offsets\":[0,16]}}\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00";
    /// let tensors = TensorBuffer::deserialize(serialized).unwrap();
    /// let tensor = tensors.tensor("test").unwrap();
    /// assert_eq!(tensor.shape(), [2, 2]);
    /// ```
    pub fn deserialize(buffer: &'data [u8]) -> Result<Self, TensorFileError> {
        let (header_size, metadata) = read_header(buffer)?;
        Ok(Self {
            header_size,
            metadata,
            data: &buffer[N_LEN + header_size..],
        })
    }

    /// The size of the JSON header in bytes.
    pub fn header_size(&self) -> usize {
        self.header_size
    }

    /// The parsed tensor directory.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The raw payload region following the header.
    pub fn data(&self) -> &'data [u8] {
        self.data
    }

    /// Allow the user to get a specific tensor within the archive.
    /// The tensor returned is merely a view and the data is not owned by
    /// this structure. `None` when the name is absent or the recorded
    /// span falls outside the payload.
    pub fn tensor(&self, name: &str) -> Option<TensorView<'data>> {
        let index = self.metadata.index_of(name)?;
        Some(view_of(&self.metadata, self.data, index)?.1)
    }

    /// The name and view at `index`, in header order.
    pub fn tensor_at(&self, index: usize) -> Option<(&str, TensorView<'data>)> {
        view_of(&self.metadata, self.data, index)
    }

    /// Returns an iterator over the tensors, in header order.
    ///
    /// Tensors whose recorded span falls outside the payload are skipped;
    /// run [`TensorBuffer::validate_data_offsets`] first to surface those
    /// as errors instead.
    pub fn iter(&self) -> impl Iterator<Item = (&str, TensorView<'data>)> {
        (0..self.metadata.len()).filter_map(|index| view_of(&self.metadata, self.data, index))
    }

    /// Returns the tensors contained within the archive.
    /// The tensors returned are merely views and the data is not owned by
    /// this structure.
    pub fn tensors(&self) -> Vec<(String, TensorView<'data>)> {
        self.iter()
            .map(|(name, view)| (name.to_string(), view))
            .collect()
    }

    /// Return the names of the tensors, in header order.
    pub fn names(&self) -> Vec<&'_ str> {
        self.metadata.names()
    }

    /// Return how many tensors are currently stored within the archive.
    #[inline]
    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    /// Indicate if the archive contains any tensor.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    /// Looks up one `"__metadata__"` value by key.
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.metadata_value(key)
    }

    /// Checks every tensor's span against the payload, see
    /// [`Metadata::validate_offsets`].
    pub fn validate_data_offsets(&self) -> Result<(), TensorFileError> {
        self.metadata.validate_offsets(self.data.len())
    }
}

/// Whether a [`TensorFile`] owns a heap copy of the payload or holds a
/// read-only mapping of the source file.
#[cfg(feature = "std")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// The payload bytes were copied into an owned buffer.
    Copied,
    /// The payload is a view into a memory-mapped file.
    Mapped,
}

#[cfg(feature = "std")]
#[derive(Debug)]
enum Payload {
    Owned(Vec<u8>),
    Mapped(crate::mmap::MappedFile),
}

/// An archive loaded from a file or buffer, owning its payload for the
/// lifetime of the value.
///
/// Construction either copies the payload into a heap buffer
/// ([`TensorFile::load`], [`TensorFile::load_from_memory`]) or maps the
/// file read-only ([`TensorFile::mmap`]). Either way the value is
/// immutable once built, and dropping it releases the buffer or the
/// mapping.
///
/// ```no_run
/// use tensorfile::TensorFile;
///
/// let archive = TensorFile::mmap("model.safetensors")?;
/// archive.validate_data_offsets()?;
/// for (name, view) in archive.iter() {
///     println!("{name}: {:?} x {}", view.shape(), view.dtype());
/// }
/// # Ok::<(), tensorfile::TensorFileError>(())
/// ```
#[cfg(feature = "std")]
#[derive(Debug)]
pub struct TensorFile {
    header_size: usize,
    metadata: Metadata,
    payload: Payload,
}

#[cfg(feature = "std")]
impl TensorFile {
    /// Reads the whole file into memory and keeps an owned copy of the
    /// payload.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, TensorFileError> {
        let mut buffer = std::fs::read(path)?;
        let (header_size, metadata) = read_header(&buffer)?;
        // Shift the payload down in place rather than reallocating it.
        buffer.drain(..N_LEN + header_size);
        Ok(Self {
            header_size,
            metadata,
            payload: Payload::Owned(buffer),
        })
    }

    /// Parses `buffer` and copies its payload into owned storage.
    pub fn load_from_memory(buffer: &[u8]) -> Result<Self, TensorFileError> {
        let (header_size, metadata) = read_header(buffer)?;
        Ok(Self {
            header_size,
            metadata,
            payload: Payload::Owned(buffer[N_LEN + header_size..].to_vec()),
        })
    }

    /// Maps the file read-only and parses it in place; tensor views point
    /// straight into the mapping.
    pub fn mmap(path: impl AsRef<std::path::Path>) -> Result<Self, TensorFileError> {
        let map = crate::mmap::MappedFile::open(path.as_ref())?;
        let (header_size, metadata) = read_header(map.as_bytes())?;
        Ok(Self {
            header_size,
            metadata,
            payload: Payload::Mapped(map),
        })
    }

    /// Whether the payload is owned or memory-mapped.
    pub fn mode(&self) -> LoadMode {
        match self.payload {
            Payload::Owned(_) => LoadMode::Copied,
            Payload::Mapped(_) => LoadMode::Mapped,
        }
    }

    /// The size of the JSON header in bytes.
    pub fn header_size(&self) -> usize {
        self.header_size
    }

    /// The parsed tensor directory.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The raw payload region following the header.
    pub fn data(&self) -> &[u8] {
        match &self.payload {
            Payload::Owned(buffer) => buffer,
            // `read_header` already proved the mapping covers the header.
            Payload::Mapped(map) => &map.as_bytes()[N_LEN + self.header_size..],
        }
    }

    /// Looks up one tensor by name; see [`TensorBuffer::tensor`].
    pub fn tensor(&self, name: &str) -> Option<TensorView<'_>> {
        let index = self.metadata.index_of(name)?;
        Some(view_of(&self.metadata, self.data(), index)?.1)
    }

    /// The name and view at `index`, in header order.
    pub fn tensor_at(&self, index: usize) -> Option<(&str, TensorView<'_>)> {
        view_of(&self.metadata, self.data(), index)
    }

    /// Returns an iterator over the tensors, in header order, skipping
    /// entries whose span falls outside the payload.
    pub fn iter(&self) -> impl Iterator<Item = (&str, TensorView<'_>)> {
        let data = self.data();
        (0..self.metadata.len()).filter_map(move |index| view_of(&self.metadata, data, index))
    }

    /// Returns the tensors contained within the archive as owned names
    /// plus borrowed views.
    pub fn tensors(&self) -> Vec<(String, TensorView<'_>)> {
        self.iter()
            .map(|(name, view)| (name.to_string(), view))
            .collect()
    }

    /// Return the names of the tensors, in header order.
    pub fn names(&self) -> Vec<&'_ str> {
        self.metadata.names()
    }

    /// Return how many tensors are currently stored within the archive.
    #[inline]
    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    /// Indicate if the archive contains any tensor.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    /// Looks up one `"__metadata__"` value by key.
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.metadata_value(key)
    }

    /// Checks every tensor's span against the payload, see
    /// [`Metadata::validate_offsets`].
    pub fn validate_data_offsets(&self) -> Result<(), TensorFileError> {
        self.metadata.validate_offsets(self.data().len())
    }
}
