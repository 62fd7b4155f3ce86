#![no_main]

use libfuzzer_sys::fuzz_target;
use tensorfile::TensorBuffer;

fuzz_target!(|data: &[u8]| {
    if let Ok(archive) = TensorBuffer::deserialize(data) {
        let _ = archive.validate_data_offsets();
        for (_, view) in archive.iter() {
            let _ = view.data().len();
        }
    }
});
