#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use bytemuck::Pod;
use fusor_storage::{
    BufferDescriptor, CleanupRegistry, Context, ImageDescriptor, MemoryRequirements, ResourceRef,
    StorageDevice, StorageError,
};
use parking_lot::Mutex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockImage {
    pub id: usize,
    pub descriptor: ImageDescriptor,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockBuffer {
    pub id: usize,
    pub descriptor: BufferDescriptor,
}

#[derive(Debug, PartialEq, Eq)]
pub struct MockParamBuffer {
    pub id: usize,
}

#[derive(Debug, Default)]
struct MockDeviceInner {
    supports_f16: bool,
    fail_allocations: AtomicBool,
    next_id: AtomicUsize,
    committed: Mutex<Vec<usize>>,
    params: Mutex<HashMap<usize, Vec<u8>>>,
    param_writes: AtomicUsize,
}

/// An in-memory device that records every resource it creates.
#[derive(Clone, Debug)]
pub struct MockDevice {
    inner: Arc<MockDeviceInner>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::with_f16(true)
    }

    pub fn with_f16(supports_f16: bool) -> Self {
        Self {
            inner: Arc::new(MockDeviceInner {
                supports_f16,
                ..Default::default()
            }),
        }
    }

    pub fn fail_allocations(&self, fail: bool) {
        self.inner.fail_allocations.store(fail, Ordering::SeqCst);
    }

    pub fn is_committed(&self, id: usize) -> bool {
        self.inner.committed.lock().contains(&id)
    }

    pub fn param<T: Pod>(&self, buffer: &MockParamBuffer) -> T {
        let params = self.inner.params.lock();
        bytemuck::pod_read_unaligned(&params[&buffer.id])
    }

    pub fn param_buffers(&self) -> usize {
        self.inner.params.lock().len()
    }

    /// The number of images, buffers and param buffers created so far.
    pub fn created(&self) -> usize {
        self.inner.next_id.load(Ordering::SeqCst)
    }

    pub fn param_writes(&self) -> usize {
        self.inner.param_writes.load(Ordering::SeqCst)
    }

    fn allocate_id(&self, reserve_memory: bool) -> Result<usize, StorageError> {
        if self.inner.fail_allocations.load(Ordering::SeqCst) {
            return Err(StorageError::Allocation("out of device memory".to_string()));
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        if reserve_memory {
            self.inner.committed.lock().push(id);
        }
        Ok(id)
    }
}

impl StorageDevice for MockDevice {
    type Image = MockImage;
    type Buffer = MockBuffer;
    type ParamBuffer = MockParamBuffer;

    fn supports_f16_storage(&self) -> bool {
        self.inner.supports_f16
    }

    fn create_image(&self, descriptor: &ImageDescriptor) -> Result<MockImage, StorageError> {
        Ok(MockImage {
            id: self.allocate_id(descriptor.reserve_memory)?,
            descriptor: *descriptor,
        })
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<MockBuffer, StorageError> {
        Ok(MockBuffer {
            id: self.allocate_id(descriptor.reserve_memory)?,
            descriptor: *descriptor,
        })
    }

    fn memory_requirements(&self, resource: ResourceRef<'_, Self>) -> MemoryRequirements {
        let size = match resource {
            ResourceRef::Image(image) => {
                let extents = image.descriptor.extents;
                (extents.width * extents.height * extents.depth) as u64
                    * 4
                    * image.descriptor.dtype.element_size() as u64
            }
            ResourceRef::Buffer(buffer) => buffer.descriptor.size_in_bytes().unwrap_or(u64::MAX),
        };
        MemoryRequirements {
            size,
            alignment: 16,
        }
    }

    fn commit_memory(&self, resource: ResourceRef<'_, Self>) -> Result<(), StorageError> {
        let id = match resource {
            ResourceRef::Image(image) => image.id,
            ResourceRef::Buffer(buffer) => buffer.id,
        };
        self.inner.committed.lock().push(id);
        Ok(())
    }

    fn create_param_buffer(&self, contents: &[u8]) -> Result<MockParamBuffer, StorageError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.params.lock().insert(id, contents.to_vec());
        Ok(MockParamBuffer { id })
    }

    fn update_param_buffer(&self, buffer: &MockParamBuffer, contents: &[u8]) {
        self.inner.param_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.params.lock().insert(buffer.id, contents.to_vec());
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Released {
    Image(usize),
    Buffer(usize),
}

/// Records the resources released through it instead of freeing them.
#[derive(Debug, Default)]
pub struct MockCleanup {
    released: Mutex<Vec<Released>>,
}

impl MockCleanup {
    pub fn released(&self) -> Vec<Released> {
        self.released.lock().clone()
    }
}

impl CleanupRegistry<MockDevice> for MockCleanup {
    fn defer_image(&self, image: MockImage) {
        self.released.lock().push(Released::Image(image.id));
    }

    fn defer_buffer(&self, buffer: MockBuffer) {
        self.released.lock().push(Released::Buffer(buffer.id));
    }
}

pub fn context() -> (Context<MockDevice>, MockDevice, Arc<MockCleanup>) {
    context_with(MockDevice::new())
}

pub fn context_with(device: MockDevice) -> (Context<MockDevice>, MockDevice, Arc<MockCleanup>) {
    let cleanup = Arc::new(MockCleanup::default());
    let context = Context::new(device.clone(), cleanup.clone());
    (context, device, cleanup)
}
