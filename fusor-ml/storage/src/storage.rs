use enumset::EnumSet;

use crate::{
    AccessMode, AccessRecord, BufferBarrier, BufferDescriptor, Context, DataTypeEnum, Extent3D,
    ImageBarrier, ImageDescriptor, ImageLayout, MemoryRequirements, PackingPolicy,
    PipelineBarrier, PipelineStage, ResourceRef, StorageDevice, StorageError, StorageKind,
    checked_numel, compute_extents, memory_access,
};

/// A barrier that synchronizes the resources of a [`StorageDevice`].
pub type DeviceBarrier<D> =
    PipelineBarrier<<D as StorageDevice>::Image, <D as StorageDevice>::Buffer>;

#[derive(Debug)]
pub struct ImageResource<I> {
    image: I,
    extents: Extent3D,
    layout: ImageLayout,
}

impl<I> ImageResource<I> {
    pub fn image(&self) -> &I {
        &self.image
    }

    pub fn extents(&self) -> Extent3D {
        self.extents
    }

    pub fn layout(&self) -> ImageLayout {
        self.layout
    }
}

#[derive(Debug)]
pub struct LinearResource<B> {
    buffer: B,
    len: usize,
}

impl<B> LinearResource<B> {
    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    /// The number of elements the buffer holds.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// The single GPU resource that stores a tensor.
pub enum Resource<D: StorageDevice> {
    Image(ImageResource<D::Image>),
    Linear(LinearResource<D::Buffer>),
}

impl<D: StorageDevice> Resource<D> {
    pub fn handle(&self) -> ResourceRef<'_, D> {
        match self {
            Resource::Image(resource) => ResourceRef::Image(&resource.image),
            Resource::Linear(resource) => ResourceRef::Buffer(&resource.buffer),
        }
    }
}

impl<D: StorageDevice> std::fmt::Debug for Resource<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Image(resource) => f.debug_tuple("Image").field(resource).finish(),
            Resource::Linear(resource) => f.debug_tuple("Linear").field(resource).finish(),
        }
    }
}

/// Owns the physical resource behind a tensor and tracks how it was last accessed so the
/// barriers needed before the next access can be emitted.
pub struct PhysicalStorage<D: StorageDevice> {
    context: Context<D>,
    kind: StorageKind,
    dtype: DataTypeEnum,
    owns_memory: bool,
    // Only `None` after the storage has been flushed
    resource: Option<Resource<D>>,
    last_access: AccessRecord,
}

impl<D: StorageDevice> PhysicalStorage<D> {
    pub fn allocate(
        context: &Context<D>,
        physical_shape: &[usize],
        kind: StorageKind,
        packing: PackingPolicy,
        dtype: DataTypeEnum,
        reserve_memory: bool,
    ) -> Result<Self, StorageError> {
        let resource =
            Self::create_resource(context, physical_shape, kind, packing, dtype, reserve_memory)?;

        Ok(Self {
            context: context.clone(),
            kind,
            dtype,
            owns_memory: reserve_memory,
            resource: Some(resource),
            last_access: AccessRecord::default(),
        })
    }

    fn create_resource(
        context: &Context<D>,
        physical_shape: &[usize],
        kind: StorageKind,
        packing: PackingPolicy,
        dtype: DataTypeEnum,
        reserve_memory: bool,
    ) -> Result<Resource<D>, StorageError> {
        let device = context.device();
        if kind.is_image() {
            let extents = compute_extents(physical_shape, kind, packing)?;
            let image = device.create_image(&ImageDescriptor {
                kind,
                extents,
                dtype,
                reserve_memory,
            })?;
            tracing::debug!(?kind, %extents, %dtype, reserve_memory, "Allocated image storage");

            Ok(Resource::Image(ImageResource {
                image,
                extents,
                layout: ImageLayout::Undefined,
            }))
        } else {
            let len = checked_numel(physical_shape).ok_or_else(|| {
                StorageError::invalid_shape(
                    physical_shape,
                    "the number of elements overflows usize",
                )
            })?;
            let descriptor = BufferDescriptor {
                len,
                dtype,
                reserve_memory,
            };
            if descriptor.size_in_bytes().is_none() {
                return Err(StorageError::invalid_shape(
                    physical_shape,
                    "the buffer size in bytes overflows u64",
                ));
            }
            let buffer = device.create_buffer(&descriptor)?;
            tracing::debug!(len, %dtype, reserve_memory, "Allocated linear storage");

            Ok(Resource::Linear(LinearResource { buffer, len }))
        }
    }

    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    pub fn dtype(&self) -> DataTypeEnum {
        self.dtype
    }

    pub fn resource(&self) -> Option<&Resource<D>> {
        self.resource.as_ref()
    }

    /// The extents of the allocated image. Linear storage has no extents.
    pub fn extents(&self) -> Extent3D {
        match &self.resource {
            Some(Resource::Image(resource)) => resource.extents,
            _ => Extent3D::ZERO,
        }
    }

    /// The number of elements in the allocated buffer. Image storage has no buffer length.
    pub fn buffer_len(&self) -> usize {
        match &self.resource {
            Some(Resource::Linear(resource)) => resource.len,
            _ => 0,
        }
    }

    pub fn last_access(&self) -> AccessRecord {
        self.last_access
    }

    /// Check if the resource has backing memory committed to it.
    pub fn owns_memory(&self) -> bool {
        self.owns_memory
    }

    pub fn memory_requirements(&self) -> Option<MemoryRequirements> {
        let resource = self.resource.as_ref()?;
        Some(self.context.device().memory_requirements(resource.handle()))
    }

    /// Commit memory to a resource that was allocated without reserving memory. This does
    /// nothing if the resource already owns its memory.
    ///
    /// The memory is committed by the device and owned by this storage from then on, so a
    /// later [`PhysicalStorage::discard_and_reallocate`] reserves memory for the replacement
    /// right away. Binding an allocation shared with other tensors is not supported.
    pub fn commit_memory(&mut self) -> Result<(), StorageError> {
        if self.owns_memory {
            return Ok(());
        }
        if let Some(resource) = &self.resource {
            self.context.device().commit_memory(resource.handle())?;
            tracing::debug!(kind = ?self.kind, "Committed deferred storage memory");
            self.owns_memory = true;
        }
        Ok(())
    }

    /// Prepare the resource to be used at `stage` with the given access. If the previous
    /// access wrote to the resource, or an image needs a different layout, a barrier is added
    /// to `barrier`. Returns true if a barrier was added.
    pub fn request_access(
        &mut self,
        barrier: &mut DeviceBarrier<D>,
        stage: PipelineStage,
        access: impl Into<EnumSet<AccessMode>>,
    ) -> bool {
        let access = access.into();
        let previous = self.last_access;
        let src_access = memory_access(previous.stage, previous.access);
        let dst_access = memory_access(Some(stage), access);

        let emitted = match &mut self.resource {
            Some(Resource::Image(resource)) => {
                let new_layout = ImageLayout::for_access(stage, access);
                let required = previous.written() || resource.layout != new_layout;
                if required {
                    barrier.add_stages(previous.stage, stage);
                    barrier.images.push(ImageBarrier {
                        src_access,
                        dst_access,
                        old_layout: resource.layout,
                        new_layout,
                        extents: resource.extents,
                        image: resource.image.clone(),
                    });
                    tracing::trace!(
                        ?previous,
                        ?stage,
                        old_layout = ?resource.layout,
                        ?new_layout,
                        "Emitted image barrier"
                    );
                }
                resource.layout = new_layout;
                required
            }
            Some(Resource::Linear(resource)) => {
                let required = previous.written();
                if required {
                    barrier.add_stages(previous.stage, stage);
                    barrier.buffers.push(BufferBarrier {
                        src_access,
                        dst_access,
                        buffer: resource.buffer.clone(),
                    });
                    tracing::trace!(?previous, ?stage, "Emitted buffer barrier");
                }
                required
            }
            None => false,
        };

        self.last_access = AccessRecord::new(stage, access);
        emitted
    }

    /// Replace the resource with a new one sized for `physical_shape`. The old resource is
    /// released through the cleanup registry once the GPU is done with it. The new resource
    /// reserves memory only if the old one owned its memory.
    ///
    /// If allocation fails, the current resource is left untouched.
    pub fn discard_and_reallocate(
        &mut self,
        physical_shape: &[usize],
        packing: PackingPolicy,
        dtype: DataTypeEnum,
    ) -> Result<(), StorageError> {
        let resource = Self::create_resource(
            &self.context,
            physical_shape,
            self.kind,
            packing,
            dtype,
            self.owns_memory,
        )?;

        self.flush();
        tracing::debug!(kind = ?self.kind, ?physical_shape, "Reallocated storage");
        self.resource = Some(resource);
        self.dtype = dtype;
        Ok(())
    }

    /// Hand the resource to the cleanup registry and forget its access history. Calling this
    /// more than once is a no-op.
    pub fn flush(&mut self) {
        if let Some(resource) = self.resource.take() {
            let cleanup = self.context.cleanup();
            match resource {
                Resource::Image(resource) => cleanup.defer_image(resource.image),
                Resource::Linear(resource) => cleanup.defer_buffer(resource.buffer),
            }
            tracing::debug!(kind = ?self.kind, "Flushed storage");
        }
        self.last_access = AccessRecord::default();
    }
}

impl<D: StorageDevice> Drop for PhysicalStorage<D> {
    fn drop(&mut self) {
        self.flush();
    }
}

impl<D: StorageDevice> std::fmt::Debug for PhysicalStorage<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalStorage")
            .field("kind", &self.kind)
            .field("dtype", &self.dtype)
            .field("owns_memory", &self.owns_memory)
            .field("resource", &self.resource)
            .field("last_access", &self.last_access)
            .finish()
    }
}
