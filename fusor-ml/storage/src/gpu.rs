//! A [`StorageDevice`] backed by wgpu.
//!
//! wgpu does not expose unbound resources, so a resource created without reserving memory
//! keeps its descriptor and creates the underlying texture or buffer when memory is committed.

use std::{
    fmt::Debug,
    sync::{Arc, OnceLock},
};

use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use crate::{
    BufferDescriptor, CleanupRegistry, Context, DataTypeEnum, ImageDescriptor,
    MemoryRequirements, ResourceRef, StorageDevice, StorageError, StorageKind,
};

struct WgpuDeviceInner {
    device: wgpu::Device,
    queue: wgpu::Queue,
}

impl Debug for WgpuDeviceInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuDeviceInner")
            .field("device", &self.device)
            .field("queue", &self.queue)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct WgpuDevice {
    inner: Arc<WgpuDeviceInner>,
}

impl WgpuDevice {
    pub async fn new() -> Result<Self, StorageError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&Default::default())
            .await
            .map_err(|err| StorageError::DeviceRequest(err.to_string()))?;
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                required_features: adapter.features() & wgpu::Features::SHADER_F16,
                ..Default::default()
            })
            .await
            .map_err(|err| StorageError::DeviceRequest(err.to_string()))?;

        Ok(Self::from_parts(device, queue))
    }

    pub fn from_parts(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            inner: Arc::new(WgpuDeviceInner { device, queue }),
        }
    }

    /// Create a context for tensors on this device along with the cleanup registry it
    /// releases resources through. Call [`WgpuCleanup::retire_submitted`] after each
    /// submission.
    pub fn context(&self) -> (Context<Self>, Arc<WgpuCleanup>) {
        let cleanup = Arc::new(WgpuCleanup::new(self));
        (Context::new(self.clone(), cleanup.clone()), cleanup)
    }

    pub fn wgpu_device(&self) -> &wgpu::Device {
        &self.inner.device
    }

    pub fn wgpu_queue(&self) -> &wgpu::Queue {
        &self.inner.queue
    }
}

fn texture_format(dtype: DataTypeEnum) -> wgpu::TextureFormat {
    match dtype {
        DataTypeEnum::F32 => wgpu::TextureFormat::Rgba32Float,
        DataTypeEnum::F16 => wgpu::TextureFormat::Rgba16Float,
        DataTypeEnum::I32 => wgpu::TextureFormat::Rgba32Sint,
        DataTypeEnum::U32 => wgpu::TextureFormat::Rgba32Uint,
    }
}

/// Check a texture against the device limits. wgpu panics on invalid textures instead of
/// returning an error.
fn check_texture_limits(
    limits: &wgpu::Limits,
    dimension: wgpu::TextureDimension,
    size: wgpu::Extent3d,
) -> Result<(), StorageError> {
    let (max_side, max_layers) = match dimension {
        wgpu::TextureDimension::D3 => (
            limits.max_texture_dimension_3d,
            limits.max_texture_dimension_3d,
        ),
        _ => (
            limits.max_texture_dimension_2d,
            limits.max_texture_array_layers,
        ),
    };
    if size.width > max_side || size.height > max_side || size.depth_or_array_layers > max_layers
    {
        return Err(StorageError::Allocation(format!(
            "{dimension:?} texture of size {}x{}x{} exceeds the device limits \
             (max side {max_side}, max depth {max_layers})",
            size.width, size.height, size.depth_or_array_layers
        )));
    }
    Ok(())
}

/// The size of a storage buffer holding `size_in_bytes`, checked against the device limits.
fn checked_buffer_size(
    limits: &wgpu::Limits,
    size_in_bytes: Option<u64>,
) -> Result<u64, StorageError> {
    let size = size_in_bytes
        .and_then(|size| {
            size.max(wgpu::COPY_BUFFER_ALIGNMENT)
                .checked_next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT)
        })
        .ok_or_else(|| StorageError::Allocation("buffer size overflows u64".to_string()))?;
    if size > limits.max_buffer_size {
        return Err(StorageError::Allocation(format!(
            "buffer of {size} bytes exceeds the device limit of {} bytes",
            limits.max_buffer_size
        )));
    }
    Ok(size)
}

#[derive(Debug)]
struct LazyTexture {
    descriptor: wgpu::TextureDescriptor<'static>,
    texel_size: u64,
    texture: OnceLock<wgpu::Texture>,
}

/// An image that may not have memory committed yet.
#[derive(Clone, Debug)]
pub struct WgpuImage {
    inner: Arc<LazyTexture>,
}

impl WgpuImage {
    /// The texture, if memory has been committed.
    pub fn texture(&self) -> Option<&wgpu::Texture> {
        self.inner.texture.get()
    }

    pub fn size(&self) -> wgpu::Extent3d {
        self.inner.descriptor.size
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        self.inner.descriptor.format
    }

    fn commit(&self, device: &wgpu::Device) -> &wgpu::Texture {
        self.inner
            .texture
            .get_or_init(|| device.create_texture(&self.inner.descriptor))
    }
}

#[derive(Debug)]
struct LazyBuffer {
    descriptor: wgpu::BufferDescriptor<'static>,
    buffer: OnceLock<wgpu::Buffer>,
}

/// A storage buffer that may not have memory committed yet.
#[derive(Clone, Debug)]
pub struct WgpuBuffer {
    inner: Arc<LazyBuffer>,
}

impl WgpuBuffer {
    /// The buffer, if memory has been committed.
    pub fn buffer(&self) -> Option<&wgpu::Buffer> {
        self.inner.buffer.get()
    }

    pub fn size(&self) -> u64 {
        self.inner.descriptor.size
    }

    fn commit(&self, device: &wgpu::Device) -> &wgpu::Buffer {
        self.inner
            .buffer
            .get_or_init(|| device.create_buffer(&self.inner.descriptor))
    }
}

impl StorageDevice for WgpuDevice {
    type Image = WgpuImage;
    type Buffer = WgpuBuffer;
    type ParamBuffer = wgpu::Buffer;

    fn supports_f16_storage(&self) -> bool {
        self.wgpu_device()
            .features()
            .contains(wgpu::Features::SHADER_F16)
    }

    fn create_image(&self, descriptor: &ImageDescriptor) -> Result<Self::Image, StorageError> {
        let dimension = match descriptor.kind {
            StorageKind::Image2D => wgpu::TextureDimension::D2,
            StorageKind::Image3D => wgpu::TextureDimension::D3,
            StorageKind::Linear => {
                return Err(StorageError::WrongStorageKind {
                    requested: "image",
                    actual: StorageKind::Linear,
                });
            }
        };
        let extents = descriptor.extents;
        // Empty tensors still need a valid texture to bind
        let size = wgpu::Extent3d {
            width: extents.width.max(1),
            height: extents.height.max(1),
            depth_or_array_layers: extents.depth.max(1),
        };
        check_texture_limits(&self.wgpu_device().limits(), dimension, size)?;

        let format = texture_format(descriptor.dtype);
        let image = WgpuImage {
            inner: Arc::new(LazyTexture {
                descriptor: wgpu::TextureDescriptor {
                    label: Some("tensor image"),
                    size,
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension,
                    format,
                    usage: wgpu::TextureUsages::STORAGE_BINDING
                        | wgpu::TextureUsages::TEXTURE_BINDING
                        | wgpu::TextureUsages::COPY_SRC
                        | wgpu::TextureUsages::COPY_DST,
                    view_formats: &[],
                },
                texel_size: 4 * descriptor.dtype.element_size() as u64,
                texture: OnceLock::new(),
            }),
        };
        if descriptor.reserve_memory {
            image.commit(self.wgpu_device());
        }
        Ok(image)
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<Self::Buffer, StorageError> {
        let limits = self.wgpu_device().limits();
        let size = checked_buffer_size(&limits, descriptor.size_in_bytes())?;
        let buffer = WgpuBuffer {
            inner: Arc::new(LazyBuffer {
                descriptor: wgpu::BufferDescriptor {
                    label: Some("tensor buffer"),
                    size,
                    usage: wgpu::BufferUsages::STORAGE
                        | wgpu::BufferUsages::COPY_SRC
                        | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                },
                buffer: OnceLock::new(),
            }),
        };
        if descriptor.reserve_memory {
            buffer.commit(self.wgpu_device());
        }
        Ok(buffer)
    }

    fn memory_requirements(&self, resource: ResourceRef<'_, Self>) -> MemoryRequirements {
        match resource {
            ResourceRef::Image(image) => {
                let size = image.size();
                MemoryRequirements {
                    size: size.width as u64
                        * size.height as u64
                        * size.depth_or_array_layers as u64
                        * image.inner.texel_size,
                    alignment: wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as u64,
                }
            }
            ResourceRef::Buffer(buffer) => MemoryRequirements {
                size: buffer.size(),
                alignment: wgpu::COPY_BUFFER_ALIGNMENT,
            },
        }
    }

    fn commit_memory(&self, resource: ResourceRef<'_, Self>) -> Result<(), StorageError> {
        match resource {
            ResourceRef::Image(image) => {
                image.commit(self.wgpu_device());
            }
            ResourceRef::Buffer(buffer) => {
                buffer.commit(self.wgpu_device());
            }
        }
        Ok(())
    }

    fn create_param_buffer(&self, contents: &[u8]) -> Result<Self::ParamBuffer, StorageError> {
        Ok(self
            .wgpu_device()
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("tensor params"),
                contents,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            }))
    }

    fn update_param_buffer(&self, buffer: &Self::ParamBuffer, contents: &[u8]) {
        self.wgpu_queue().write_buffer(buffer, 0, contents);
    }
}

// Only held so the resource outlives the work that uses it
#[allow(dead_code)]
#[derive(Debug)]
enum Retired {
    Image(WgpuImage),
    Buffer(WgpuBuffer),
}

/// Holds released resources until the work submitted before their release has finished.
#[derive(Debug)]
pub struct WgpuCleanup {
    device: WgpuDevice,
    pending: Mutex<Vec<Retired>>,
    // Batches whose work has completed. They are dropped outside of the queue callback.
    completed: Arc<Mutex<Vec<Vec<Retired>>>>,
}

impl WgpuCleanup {
    pub fn new(device: &WgpuDevice) -> Self {
        Self {
            device: device.clone(),
            pending: Mutex::new(Vec::new()),
            completed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Release every resource whose work has completed and schedule the resources released
    /// since the last call to be freed once the work submitted so far is done.
    pub fn retire_submitted(&self) {
        let completed = std::mem::take(&mut *self.completed.lock());
        if !completed.is_empty() {
            tracing::debug!(batches = completed.len(), "Releasing retired tensor resources");
        }
        drop(completed);

        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return;
        }
        let completed = self.completed.clone();
        self.device
            .wgpu_queue()
            .on_submitted_work_done(move || completed.lock().push(batch));
    }

    /// The number of released resources that have not been scheduled for cleanup yet.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

impl CleanupRegistry<WgpuDevice> for WgpuCleanup {
    fn defer_image(&self, image: WgpuImage) {
        self.pending.lock().push(Retired::Image(image));
    }

    fn defer_buffer(&self, buffer: WgpuBuffer) {
        self.pending.lock().push(Retired::Buffer(buffer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(width: u32, height: u32, depth_or_array_layers: u32) -> wgpu::Extent3d {
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers,
        }
    }

    #[test]
    fn textures_are_checked_against_limits() {
        let limits = wgpu::Limits::default();
        let max_3d = limits.max_texture_dimension_3d;
        let max_layers = limits.max_texture_array_layers;

        check_texture_limits(&limits, wgpu::TextureDimension::D3, extent(max_3d, 1, max_3d))
            .unwrap();
        let result =
            check_texture_limits(&limits, wgpu::TextureDimension::D3, extent(max_3d + 1, 1, 1));
        assert!(matches!(result, Err(StorageError::Allocation(_))));

        check_texture_limits(&limits, wgpu::TextureDimension::D2, extent(4, 4, max_layers))
            .unwrap();
        let result = check_texture_limits(
            &limits,
            wgpu::TextureDimension::D2,
            extent(4, 4, max_layers + 1),
        );
        assert!(matches!(result, Err(StorageError::Allocation(_))));
    }

    #[test]
    fn buffers_are_checked_against_limits() {
        let limits = wgpu::Limits::default();
        assert_eq!(checked_buffer_size(&limits, Some(0)).unwrap(), 4);
        assert_eq!(checked_buffer_size(&limits, Some(6)).unwrap(), 8);
        assert_eq!(
            checked_buffer_size(&limits, Some(limits.max_buffer_size)).unwrap(),
            limits.max_buffer_size
        );

        let result = checked_buffer_size(&limits, Some(limits.max_buffer_size + 1));
        assert!(matches!(result, Err(StorageError::Allocation(_))));
        let result = checked_buffer_size(&limits, None);
        assert!(matches!(result, Err(StorageError::Allocation(_))));
        let result = checked_buffer_size(&limits, Some(u64::MAX));
        assert!(matches!(result, Err(StorageError::Allocation(_))));
    }
}
