use std::{fmt::Debug, sync::Arc};

use crate::{DataTypeEnum, Extent3D, StorageError, StorageKind};

/// Describes an image a [`StorageDevice`] should create.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub kind: StorageKind,
    pub extents: Extent3D,
    pub dtype: DataTypeEnum,
    /// If false, only the resource is created and backing memory is committed later with
    /// [`StorageDevice::commit_memory`].
    pub reserve_memory: bool,
}

/// Describes a linear buffer a [`StorageDevice`] should create.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferDescriptor {
    /// The number of elements in the buffer
    pub len: usize,
    pub dtype: DataTypeEnum,
    pub reserve_memory: bool,
}

impl BufferDescriptor {
    /// The size of the buffer in bytes, or `None` if it overflows `u64`.
    pub fn size_in_bytes(&self) -> Option<u64> {
        u64::try_from(self.len)
            .ok()?
            .checked_mul(self.dtype.element_size() as u64)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
}

/// A borrowed handle to the resource behind a tensor.
pub enum ResourceRef<'a, D: StorageDevice> {
    Image(&'a D::Image),
    Buffer(&'a D::Buffer),
}

impl<D: StorageDevice> Clone for ResourceRef<'_, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D: StorageDevice> Copy for ResourceRef<'_, D> {}

impl<D: StorageDevice> Debug for ResourceRef<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceRef::Image(image) => f.debug_tuple("Image").field(image).finish(),
            ResourceRef::Buffer(buffer) => f.debug_tuple("Buffer").field(buffer).finish(),
        }
    }
}

/// The device that creates the resources tensors are stored in.
///
/// Handles are expected to be cheap to clone. Barriers keep a clone of the handle they
/// synchronize.
pub trait StorageDevice: Clone {
    type Image: Clone + Debug;
    type Buffer: Clone + Debug;
    type ParamBuffer: Debug;

    /// Check if the device can store 16 bit floats.
    fn supports_f16_storage(&self) -> bool;

    fn create_image(&self, descriptor: &ImageDescriptor) -> Result<Self::Image, StorageError>;

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<Self::Buffer, StorageError>;

    fn memory_requirements(&self, resource: ResourceRef<'_, Self>) -> MemoryRequirements;

    /// Commit backing memory to a resource that was created without reserving memory.
    fn commit_memory(&self, resource: ResourceRef<'_, Self>) -> Result<(), StorageError>;

    /// Create a small uniform buffer with the given contents.
    fn create_param_buffer(&self, contents: &[u8]) -> Result<Self::ParamBuffer, StorageError>;

    /// Overwrite the contents of a buffer created with [`StorageDevice::create_param_buffer`].
    fn update_param_buffer(&self, buffer: &Self::ParamBuffer, contents: &[u8]);
}

/// Releases resources once the GPU work that may still reference them has retired.
pub trait CleanupRegistry<D: StorageDevice> {
    fn defer_image(&self, image: D::Image);

    fn defer_buffer(&self, buffer: D::Buffer);
}

/// The collaborators every tensor needs: the device that creates resources and the registry
/// that releases them.
pub struct Context<D: StorageDevice> {
    device: D,
    cleanup: Arc<dyn CleanupRegistry<D> + Send + Sync>,
}

impl<D: StorageDevice> Clone for Context<D> {
    fn clone(&self) -> Self {
        Self {
            device: self.device.clone(),
            cleanup: self.cleanup.clone(),
        }
    }
}

impl<D: StorageDevice + Debug> Debug for Context<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl<D: StorageDevice> Context<D> {
    pub fn new(device: D, cleanup: Arc<dyn CleanupRegistry<D> + Send + Sync>) -> Self {
        Self { device, cleanup }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn cleanup(&self) -> &(dyn CleanupRegistry<D> + Send + Sync) {
        &*self.cleanup
    }
}
