//! GPU storage for fusor tensors.
//!
//! A [`LogicalTensor`] maps an N-dimensional tensor onto a single image or linear buffer,
//! packing one dimension into `vec4` texels for image storage. Every access goes through
//! [`PhysicalStorage::request_access`], which records the barriers a pass needs before it
//! can safely touch a resource another pass wrote.

pub use access::*;
pub use config::*;
pub use device::*;
pub use dtype::*;
pub use error::*;
pub use gpu::*;
pub use layout::*;
pub use params::{ExtentParams, PackingParams, ShapeParams};
pub use storage::*;
pub use tensor::*;

mod access;
mod config;
mod device;
mod dtype;
mod error;
mod gpu;
mod layout;
mod params;
mod storage;
mod tensor;
