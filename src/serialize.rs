//! Writing archives.
//!
//! The writer is the inverse of the loader: tensors are laid out in the
//! order they are given, the header is emitted with their `dtype`, `shape`
//! and `data_offsets`, and the payload follows tightly packed. An archive
//! written here and loaded back yields the same directory in the same
//! order, down to the metadata pairs.

use crate::lib::{Cow, String, ToString, Vec};
use crate::load::N_LEN;
use crate::tensor::{Dtype, Metadata, TensorFileError, TensorInfo, MAX_HEADER_SIZE};
#[cfg(feature = "std")]
use std::{io::Write, path::Path};

/// The trait necessary to serialize a tensor.
///
/// For an owned tensor:
///
/// ```rust
/// use tensorfile::{Dtype, View};
/// use std::borrow::Cow;
/// struct Tensor { dtype: Dtype, shape: Vec<usize>, data: Vec<u8> }
///
/// impl View for &Tensor {
///    fn dtype(&self) -> Dtype {
///        self.dtype
///    }
///    fn shape(&self) -> &[usize] {
///         &self.shape
///    }
///    fn data(&self) -> Cow<'_, [u8]> {
///        (&self.data).into()
///    }
///    fn data_len(&self) -> usize {
///        self.data.len()
///    }
/// }
/// ```
///
/// For data living somewhere a byte slice cannot reach (a GPU buffer,
/// say), `data` may materialize a local copy:
///
/// ```rust
/// use tensorfile::{Dtype, View};
/// use std::borrow::Cow;
///
/// # type OpaqueGpu = Vec<u8>;
/// struct Tensor { dtype: Dtype, shape: Vec<usize>, data: OpaqueGpu }
///
/// impl View for Tensor {
///    fn dtype(&self) -> Dtype {
///        self.dtype
///    }
///    fn shape(&self) -> &[usize] {
///         &self.shape
///    }
///    fn data(&self) -> Cow<'_, [u8]> {
///        // This copies data from the device to the host.
///        let data: Vec<u8> = self.data.to_vec();
///        data.into()
///    }
///    fn data_len(&self) -> usize {
///        let n: usize = self.shape.iter().product();
///        n * self.dtype.size()
///    }
/// }
/// ```
pub trait View {
    /// The `Dtype` of the tensor
    fn dtype(&self) -> Dtype;
    /// The shape of the tensor
    fn shape(&self) -> &[usize];
    /// The data of the tensor
    fn data(&self) -> Cow<'_, [u8]>;
    /// The length of the data, in bytes.
    /// This is necessary as this might be faster to get than `data().len()`
    /// for instance for tensors residing in GPU.
    fn data_len(&self) -> usize;
}

impl View for &crate::tensor::TensorView<'_> {
    fn dtype(&self) -> Dtype {
        crate::tensor::TensorView::dtype(self)
    }

    fn shape(&self) -> &[usize] {
        crate::tensor::TensorView::shape(self)
    }

    fn data(&self) -> Cow<'_, [u8]> {
        crate::tensor::TensorView::data(self).into()
    }

    fn data_len(&self) -> usize {
        crate::tensor::TensorView::data(self).len()
    }
}

impl View for crate::tensor::TensorView<'_> {
    fn dtype(&self) -> Dtype {
        crate::tensor::TensorView::dtype(self)
    }

    fn shape(&self) -> &[usize] {
        crate::tensor::TensorView::shape(self)
    }

    fn data(&self) -> Cow<'_, [u8]> {
        crate::tensor::TensorView::data(self).into()
    }

    fn data_len(&self) -> usize {
        crate::tensor::TensorView::data(self).len()
    }
}

struct PreparedData {
    n: u64,
    header_bytes: Vec<u8>,
    offset: usize,
}

/// Lays the tensors out in the order given and renders the header.
///
/// Offsets are assigned contiguously from zero; empty tensors take no
/// payload and carry no offsets. The header is padded with spaces to an
/// 8-byte boundary.
fn prepare<S, V, I>(
    data: I,
    data_info: Option<Vec<(String, String)>>,
) -> Result<(PreparedData, Vec<V>), TensorFileError>
where
    S: AsRef<str>,
    V: View,
    I: IntoIterator<Item = (S, V)>,
{
    let mut tensors = Vec::new();
    let mut entries = Vec::new();
    let mut offset = 0;

    for (name, tensor) in data {
        let shape = tensor.shape().to_vec();
        let info = if shape.contains(&0) {
            TensorInfo {
                dtype: tensor.dtype(),
                shape,
                data_offsets: (0, 0),
            }
        } else {
            let n = tensor.data_len();
            let info = TensorInfo {
                dtype: tensor.dtype(),
                shape,
                data_offsets: (offset, offset + n),
            };
            offset += n;
            info
        };
        entries.push((name.as_ref().to_string(), info));
        tensors.push(tensor);
    }

    let metadata = Metadata::new(data_info.unwrap_or_default(), entries)?;
    let mut header_bytes = serde_json::to_string(&metadata)?.into_bytes();

    // Force alignment to 8 bytes.
    let aligned_len = header_bytes.len().next_multiple_of(N_LEN);
    header_bytes.resize(aligned_len, b' ');

    Ok((
        PreparedData {
            n: aligned_len as u64,
            header_bytes,
            offset,
        },
        tensors,
    ))
}

/// Serialize to an owned byte buffer the dictionary of tensors.
pub fn serialize<S: AsRef<str>, V: View, I: IntoIterator<Item = (S, V)>>(
    data: I,
    data_info: Option<Vec<(String, String)>>,
) -> Result<Vec<u8>, TensorFileError> {
    let (
        PreparedData {
            n,
            header_bytes,
            offset,
        },
        tensors,
    ) = prepare(data, data_info)?;

    if n > MAX_HEADER_SIZE as u64 {
        return Err(TensorFileError::HeaderTooLarge);
    }

    let expected_size = N_LEN + header_bytes.len() + offset;
    let mut buffer: Vec<u8> = Vec::with_capacity(expected_size);
    buffer.extend(n.to_le_bytes());
    buffer.extend(header_bytes);
    for tensor in tensors {
        buffer.extend(tensor.data().as_ref());
    }

    Ok(buffer)
}

#[cfg(feature = "std")]
fn buffered_write_to_file<V: View>(
    path: impl AsRef<Path>,
    n: u64,
    header_bytes: &[u8],
    tensors: &[V],
    total_size: usize,
) -> Result<(), TensorFileError> {
    let file = std::fs::File::create(path)?;

    file.set_len(total_size as u64)?;

    // Bypassing the page cache with F_NOCACHE speeds large sequential
    // writes up noticeably on macOS.
    #[cfg(target_os = "macos")]
    unsafe {
        use std::os::fd::AsRawFd;

        libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1);
    }

    let mut f = std::io::BufWriter::with_capacity(1024 * 1024, file);

    f.write_all(n.to_le_bytes().as_ref())?;
    f.write_all(header_bytes)?;
    for tensor in tensors {
        f.write_all(tensor.data().as_ref())?;
    }

    f.flush()?;

    Ok(())
}

/// Serialize to a regular file the dictionary of tensors.
/// Writing directly to file reduces the need to allocate the whole amount
/// to memory.
#[cfg(feature = "std")]
pub fn serialize_to_file<S, V, I>(
    data: I,
    data_info: Option<Vec<(String, String)>>,
    filename: &std::path::Path,
) -> Result<(), TensorFileError>
where
    S: AsRef<str>,
    V: View,
    I: IntoIterator<Item = (S, V)>,
{
    let (
        PreparedData {
            n,
            header_bytes,
            offset,
        },
        tensors,
    ) = prepare(data, data_info)?;

    if n > MAX_HEADER_SIZE as u64 {
        return Err(TensorFileError::HeaderTooLarge);
    }

    let total_size = N_LEN + header_bytes.len() + offset;

    buffered_write_to_file(filename, n, &header_bytes, &tensors, total_size)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::TensorBuffer;
    use crate::tensor::TensorView;

    #[test]
    fn header_is_padded_and_prefixed() {
        let data = [1u8, 2, 3, 4];
        let view = TensorView::new(Dtype::U8, vec![4], &data).unwrap();
        let bytes = serialize([("t", view)], None).unwrap();

        let mut prefix = [0u8; N_LEN];
        prefix.copy_from_slice(&bytes[..N_LEN]);
        let n = u64::from_le_bytes(prefix) as usize;
        assert_eq!(n % 8, 0);
        let header = core::str::from_utf8(&bytes[N_LEN..N_LEN + n]).unwrap();
        assert!(header.starts_with('{'));
        assert!(header.ends_with(' ') || header.ends_with('}'));
        assert_eq!(
            header.trim_end(),
            r#"{"t":{"dtype":"U8","shape":[4],"data_offsets":[0,4]}}"#
        );
        assert_eq!(&bytes[N_LEN + n..], data);
    }

    #[test]
    fn offsets_are_contiguous_in_input_order() {
        let a = [0u8; 6];
        let b = [0u8; 4];
        let tensors = vec![
            ("first", TensorView::new(Dtype::U8, vec![6], &a).unwrap()),
            ("second", TensorView::new(Dtype::U16, vec![2], &b).unwrap()),
        ];
        let bytes = serialize(tensors, None).unwrap();
        let loaded = TensorBuffer::deserialize(&bytes).unwrap();
        assert_eq!(loaded.names(), ["first", "second"]);
        assert_eq!(
            loaded.metadata().info("first").unwrap().data_offsets,
            (0, 6)
        );
        assert_eq!(
            loaded.metadata().info("second").unwrap().data_offsets,
            (6, 10)
        );
        loaded.validate_data_offsets().unwrap();
    }

    #[test]
    fn empty_tensors_are_written_without_offsets() {
        let view = TensorView::new(Dtype::F32, vec![0, 3], &[]).unwrap();
        let bytes = serialize([("e", view)], None).unwrap();
        let header = core::str::from_utf8(&bytes[N_LEN..]).unwrap();
        assert!(!header.contains("data_offsets"));
        let loaded = TensorBuffer::deserialize(&bytes).unwrap();
        assert_eq!(loaded.metadata().info("e").unwrap().data_offsets, (0, 0));
    }

    #[test]
    fn metadata_pairs_keep_their_order() {
        let data = [0u8; 2];
        let view = TensorView::new(Dtype::U8, vec![2], &data).unwrap();
        let pairs = vec![
            ("zebra".to_string(), "z".to_string()),
            ("alpha".to_string(), "a".to_string()),
        ];
        let bytes = serialize([("t", view)], Some(pairs.clone())).unwrap();
        let loaded = TensorBuffer::deserialize(&bytes).unwrap();
        assert_eq!(loaded.metadata().metadata(), pairs);
    }

    #[test]
    fn duplicate_names_fail_to_serialize() {
        let data = [0u8; 2];
        let tensors = vec![
            ("t", TensorView::new(Dtype::U8, vec![2], &data).unwrap()),
            ("t", TensorView::new(Dtype::U8, vec![2], &data).unwrap()),
        ];
        assert!(matches!(
            serialize(tensors, None),
            Err(TensorFileError::DuplicateTensor(_))
        ));
    }

    #[cfg(feature = "std")]
    #[test]
    fn serialize_to_file_matches_in_memory() {
        let data: Vec<u8> = (0..32).collect();
        let view = TensorView::new(Dtype::U8, vec![32], &data).unwrap();
        let in_memory = serialize([("t", &view)], None).unwrap();

        let path = std::env::temp_dir().join(format!(
            "tensorfile_write_{}.safetensors",
            std::process::id()
        ));
        serialize_to_file([("t", &view)], None, &path).unwrap();
        let on_disk = std::fs::read(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(on_disk, in_memory);
    }
}
