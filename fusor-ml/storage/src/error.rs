use crate::{DataTypeEnum, Extent3D, StorageKind};

/// Errors produced while laying out, allocating or accessing tensor storage.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Invalid shape {shape:?}: {reason}")]
    InvalidShape {
        shape: Box<[usize]>,
        reason: &'static str,
    },
    #[error("The device does not support {0} storage")]
    UnsupportedDtype(DataTypeEnum),
    #[error("Requested {requested} handle from a tensor stored as {actual:?}")]
    WrongStorageKind {
        requested: &'static str,
        actual: StorageKind,
    },
    #[error("Resizing to {shape:?} needs {required} but only {available} is allocated")]
    CapacityExceeded {
        shape: Box<[usize]>,
        required: Capacity,
        available: Capacity,
    },
    #[error("Packed dimension of physical shape {shape:?} is not a multiple of 4")]
    MisalignedPackedDim { shape: Box<[usize]> },
    #[error("The storage resource has already been released")]
    Released,
    #[error("Failed to allocate device resource: {0}")]
    Allocation(String),
    #[error("Failed to request device: {0}")]
    DeviceRequest(String),
}

impl StorageError {
    pub(crate) fn invalid_shape(shape: &[usize], reason: &'static str) -> Self {
        Self::InvalidShape {
            shape: shape.into(),
            reason,
        }
    }
}

/// The amount of physical space a resize either needs or has available.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capacity {
    Extents(Extent3D),
    Elements(usize),
}

impl std::fmt::Display for Capacity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capacity::Extents(extents) => write!(f, "extents {extents}"),
            Capacity::Elements(len) => write!(f, "{len} elements"),
        }
    }
}
