use enumset::EnumSet;

use crate::{
    AccessMode, Capacity, Context, DataTypeEnum, DeviceBarrier, Extent3D, MemoryRequirements,
    PackingPolicy, PhysicalStorage, PipelineStage, ResourceRef, StorageConfig, StorageDevice,
    StorageError, StorageKind, compute_extents, compute_physical_shape,
    layout::numel,
    params::{LayoutParams, PackingParams, ParamSlot},
    storage::Resource,
};

/// A tensor stored on the GPU.
///
/// The tensor keeps the logical shape callers see alongside the padded physical shape of
/// the resource that backs it. Shaders read the layout through three small parameter
/// buffers that are created on first use and kept in sync with the shape on every resize.
pub struct LogicalTensor<D: StorageDevice> {
    context: Context<D>,
    dtype: DataTypeEnum,
    kind: StorageKind,
    packing: PackingPolicy,
    shape: Box<[usize]>,
    physical_shape: Box<[usize]>,
    // The extents the current shape needs. This can be smaller than the allocated extents
    // after resizing in place.
    virtual_extents: Extent3D,
    layout_params: LayoutParams,
    shape_params: ParamSlot<D>,
    extent_params: ParamSlot<D>,
    packing_params: ParamSlot<D>,
    storage: PhysicalStorage<D>,
}

impl<D: StorageDevice> LogicalTensor<D> {
    pub fn new(
        context: &Context<D>,
        shape: &[usize],
        dtype: DataTypeEnum,
        kind: StorageKind,
        packing: PackingPolicy,
        reserve_memory: bool,
    ) -> Result<Self, StorageError> {
        if dtype.requires_f16_storage() && !context.device().supports_f16_storage() {
            return Err(StorageError::UnsupportedDtype(dtype));
        }

        let physical_shape = compute_physical_shape(shape, packing, kind)?;
        let virtual_extents = compute_extents(&physical_shape, kind, packing)?;
        let layout_params = LayoutParams::new(shape, &physical_shape, virtual_extents, packing)?;
        let storage = PhysicalStorage::allocate(
            context,
            &physical_shape,
            kind,
            packing,
            dtype,
            reserve_memory,
        )?;

        Ok(Self {
            context: context.clone(),
            dtype,
            kind,
            packing,
            shape: shape.into(),
            physical_shape,
            virtual_extents,
            layout_params,
            shape_params: ParamSlot::default(),
            extent_params: ParamSlot::default(),
            packing_params: ParamSlot::default(),
            storage,
        })
    }

    /// Create a tensor with the storage kind and packing policy overrides from `config`
    /// applied.
    pub fn with_config(
        context: &Context<D>,
        shape: &[usize],
        dtype: DataTypeEnum,
        kind: StorageKind,
        packing: PackingPolicy,
        config: &StorageConfig,
    ) -> Result<Self, StorageError> {
        let (kind, packing) = config.resolve(kind, packing);
        Self::new(context, shape, dtype, kind, packing, config.reserve_memory)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn physical_shape(&self) -> &[usize] {
        &self.physical_shape
    }

    pub fn numel(&self) -> usize {
        numel(&self.shape)
    }

    /// The number of elements in the physical shape, including padding.
    pub fn gpu_numel(&self) -> usize {
        numel(&self.physical_shape)
    }

    pub fn dtype(&self) -> DataTypeEnum {
        self.dtype
    }

    pub fn storage_kind(&self) -> StorageKind {
        self.kind
    }

    pub fn packing(&self) -> PackingPolicy {
        self.packing
    }

    /// The extents of the allocated image.
    pub fn extents(&self) -> Extent3D {
        self.storage.extents()
    }

    /// The extents the current shape needs.
    pub fn virtual_extents(&self) -> Extent3D {
        self.virtual_extents
    }

    pub fn storage(&self) -> &PhysicalStorage<D> {
        &self.storage
    }

    pub fn owns_memory(&self) -> bool {
        self.storage.owns_memory()
    }

    pub fn memory_requirements(&self) -> Option<MemoryRequirements> {
        self.storage.memory_requirements()
    }

    pub fn commit_memory(&mut self) -> Result<(), StorageError> {
        self.storage.commit_memory()
    }

    /// Get the resource behind the tensor, recording any barrier needed before it is used at
    /// `stage` with `access`.
    pub fn access_for(
        &mut self,
        barrier: &mut DeviceBarrier<D>,
        stage: PipelineStage,
        access: impl Into<EnumSet<AccessMode>>,
    ) -> Result<ResourceRef<'_, D>, StorageError> {
        if self.storage.resource().is_none() {
            return Err(StorageError::Released);
        }
        self.storage.request_access(barrier, stage, access);
        self.storage
            .resource()
            .map(Resource::handle)
            .ok_or(StorageError::Released)
    }

    /// Get the image behind the tensor for reading at `stage`.
    pub fn image(
        &mut self,
        barrier: &mut DeviceBarrier<D>,
        stage: PipelineStage,
    ) -> Result<&D::Image, StorageError> {
        self.image_with_access(barrier, stage, AccessMode::Read)
    }

    pub fn image_with_access(
        &mut self,
        barrier: &mut DeviceBarrier<D>,
        stage: PipelineStage,
        access: impl Into<EnumSet<AccessMode>>,
    ) -> Result<&D::Image, StorageError> {
        let kind = self.kind;
        if !kind.is_image() {
            return Err(wrong_kind("image", kind));
        }
        match self.access_for(barrier, stage, access)? {
            ResourceRef::Image(image) => Ok(image),
            ResourceRef::Buffer(_) => Err(wrong_kind("image", kind)),
        }
    }

    /// Get the buffer behind the tensor for reading at `stage`.
    pub fn buffer(
        &mut self,
        barrier: &mut DeviceBarrier<D>,
        stage: PipelineStage,
    ) -> Result<&D::Buffer, StorageError> {
        self.buffer_with_access(barrier, stage, AccessMode::Read)
    }

    pub fn buffer_with_access(
        &mut self,
        barrier: &mut DeviceBarrier<D>,
        stage: PipelineStage,
        access: impl Into<EnumSet<AccessMode>>,
    ) -> Result<&D::Buffer, StorageError> {
        let kind = self.kind;
        if kind.is_image() {
            return Err(wrong_kind("buffer", kind));
        }
        match self.access_for(barrier, stage, access)? {
            ResourceRef::Buffer(buffer) => Ok(buffer),
            ResourceRef::Image(_) => Err(wrong_kind("buffer", kind)),
        }
    }

    /// A uniform buffer with the logical shape in (width, height, channels, batch) order.
    pub fn shape_params(&mut self) -> Result<&D::ParamBuffer, StorageError> {
        self.shape_params
            .get_or_create(self.context.device(), &self.layout_params.shape)
    }

    /// A uniform buffer with the extents of the image the current shape occupies.
    pub fn extent_params(&mut self) -> Result<&D::ParamBuffer, StorageError> {
        self.extent_params
            .get_or_create(self.context.device(), &self.layout_params.extents)
    }

    /// A uniform buffer with the [`PackingParams`] of the current shape.
    pub fn packing_params(&mut self) -> Result<&D::ParamBuffer, StorageError> {
        self.packing_params
            .get_or_create(self.context.device(), &self.layout_params.packing)
    }

    pub fn packing_metadata(&self) -> PackingParams {
        self.layout_params.packing
    }

    /// Resize the tensor and replace its resource with one sized for the new shape. The old
    /// resource is released once the GPU is done with it.
    pub fn resize(&mut self, new_shape: &[usize]) -> Result<(), StorageError> {
        let physical_shape = compute_physical_shape(new_shape, self.packing, self.kind)?;
        let virtual_extents = compute_extents(&physical_shape, self.kind, self.packing)?;
        let layout_params =
            LayoutParams::new(new_shape, &physical_shape, virtual_extents, self.packing)?;

        self.storage
            .discard_and_reallocate(&physical_shape, self.packing, self.dtype)?;
        tracing::debug!(from = ?self.shape, to = ?new_shape, "Reallocated tensor");

        self.update_size_metadata(new_shape, physical_shape, virtual_extents, layout_params);
        Ok(())
    }

    /// Resize the tensor without touching its resource. This fails if the current resource is
    /// too small to hold a tensor of the new shape.
    pub fn resize_in_place(&mut self, new_shape: &[usize]) -> Result<(), StorageError> {
        let physical_shape = compute_physical_shape(new_shape, self.packing, self.kind)?;
        let virtual_extents = compute_extents(&physical_shape, self.kind, self.packing)?;
        let layout_params =
            LayoutParams::new(new_shape, &physical_shape, virtual_extents, self.packing)?;

        let (required, available) = if self.kind.is_image() {
            (
                Capacity::Extents(virtual_extents),
                Capacity::Extents(self.storage.extents()),
            )
        } else {
            (
                Capacity::Elements(numel(&physical_shape)),
                Capacity::Elements(self.storage.buffer_len()),
            )
        };
        let fits = match (required, available) {
            (Capacity::Extents(required), Capacity::Extents(available)) => {
                required.fits_within(&available)
            }
            (Capacity::Elements(required), Capacity::Elements(available)) => {
                required <= available
            }
            _ => false,
        };
        if !fits {
            return Err(StorageError::CapacityExceeded {
                shape: new_shape.into(),
                required,
                available,
            });
        }

        tracing::debug!(from = ?self.shape, to = ?new_shape, "Resized tensor in place");
        self.update_size_metadata(new_shape, physical_shape, virtual_extents, layout_params);
        Ok(())
    }

    fn update_size_metadata(
        &mut self,
        shape: &[usize],
        physical_shape: Box<[usize]>,
        virtual_extents: Extent3D,
        layout_params: LayoutParams,
    ) {
        self.shape = shape.into();
        self.physical_shape = physical_shape;
        self.virtual_extents = virtual_extents;
        self.layout_params = layout_params;

        let device = self.context.device();
        self.shape_params.update(device, &layout_params.shape);
        self.extent_params.update(device, &layout_params.extents);
        self.packing_params.update(device, &layout_params.packing);
    }

    /// Check which parameter buffers have been created as (shape, extents, packing).
    pub fn created_params(&self) -> (bool, bool, bool) {
        (
            self.shape_params.is_created(),
            self.extent_params.is_created(),
            self.packing_params.is_created(),
        )
    }
}

fn wrong_kind(requested: &'static str, actual: StorageKind) -> StorageError {
    StorageError::WrongStorageKind { requested, actual }
}

impl<D: StorageDevice> std::fmt::Debug for LogicalTensor<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalTensor")
            .field("shape", &self.shape)
            .field("physical_shape", &self.physical_shape)
            .field("dtype", &self.dtype)
            .field("kind", &self.kind)
            .field("packing", &self.packing)
            .field("storage", &self.storage)
            .finish()
    }
}
