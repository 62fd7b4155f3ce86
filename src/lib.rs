#![deny(missing_docs)]
#![doc = include_str!("../README.md")]
#![cfg_attr(not(feature = "std"), no_std)]
pub mod half;
pub mod json;
pub mod slice;
pub mod tensor;
mod load;
#[cfg(feature = "std")]
mod mmap;
mod serialize;

pub use load::TensorBuffer;
#[cfg(feature = "std")]
pub use load::{LoadMode, TensorFile};
/// serialize_to_file only valid in std
#[cfg(feature = "std")]
pub use serialize::serialize_to_file;
pub use serialize::{serialize, View};
pub use tensor::{Dtype, Metadata, TensorFileError, TensorInfo, TensorView};

#[cfg(not(feature = "std"))]
#[macro_use]
extern crate alloc;

/// A facade around all the types we need from the `std`, `core`, and `alloc`
/// crates. This avoids elaborate import wrangling having to happen in every
/// module.
mod lib {
    #[cfg(not(feature = "std"))]
    mod no_stds {
        pub use alloc::borrow::Cow;
        pub use alloc::string::{String, ToString};
        pub use alloc::vec::Vec;
        pub use hashbrown::{HashMap, HashSet};
    }
    #[cfg(feature = "std")]
    mod stds {
        pub use std::borrow::Cow;
        pub use std::collections::{HashMap, HashSet};
        pub use std::string::{String, ToString};
        pub use std::vec::Vec;
    }
    /// choose std or no_std to export by feature flag
    #[cfg(not(feature = "std"))]
    pub use no_stds::*;
    #[cfg(feature = "std")]
    pub use stds::*;
}
