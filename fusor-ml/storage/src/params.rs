//! Small uniform payloads that describe a tensor's layout to shaders.

use bytemuck::{Pod, Zeroable};

use crate::{
    Extent3D, PackingPolicy, StorageDevice, StorageError, TEXEL_WIDTH, layout::val_at,
};

fn shader_int(value: usize, shape: &[usize]) -> Result<i32, StorageError> {
    i32::try_from(value).map_err(|_| {
        StorageError::invalid_shape(shape, "layout parameters must fit in a signed 32 bit integer")
    })
}

/// The logical shape in (width, height, channels, batch) order. Missing dimensions are 1.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct ShapeParams {
    pub whcn: [i32; 4],
}

impl ShapeParams {
    pub fn new(shape: &[usize]) -> Result<Self, StorageError> {
        let mut whcn = [0; 4];
        for (slot, index) in whcn.iter_mut().zip([-1, -2, -3, -4]) {
            *slot = shader_int(val_at(index, shape), shape)?;
        }
        Ok(Self { whcn })
    }
}

/// The extents of the image a shader is allowed to index.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct ExtentParams {
    pub limits: [i32; 3],
    padding: i32,
}

impl ExtentParams {
    pub fn new(extents: Extent3D) -> Result<Self, StorageError> {
        let shape = extents.to_array().map(|axis| axis as usize);
        let mut limits = [0; 3];
        for (slot, axis) in limits.iter_mut().zip(shape) {
            *slot = shader_int(axis, &shape)?;
        }
        Ok(Self { limits, padding: 0 })
    }
}

/// Describes how the packed dimension is laid out in texels.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct PackingParams {
    /// The logical size of the packed dimension
    pub dim_size: i32,
    /// The size of the packed dimension after alignment
    pub dim_size_padded: i32,
    /// The number of texels the packed dimension spans
    pub dim_texel_len: i32,
    /// `dim_size_padded - dim_size`
    pub padding: i32,
}

impl PackingParams {
    pub fn new(
        shape: &[usize],
        physical_shape: &[usize],
        packing: PackingPolicy,
    ) -> Result<Self, StorageError> {
        let index = -(packing.packed_dim() as isize) - 1;
        let dim_size = val_at(index, shape);
        let dim_size_padded = val_at(index, physical_shape);
        let padding = dim_size_padded.checked_sub(dim_size).ok_or_else(|| {
            StorageError::invalid_shape(shape, "the physical shape is smaller than the shape")
        })?;

        Ok(Self {
            dim_size: shader_int(dim_size, shape)?,
            dim_size_padded: shader_int(dim_size_padded, physical_shape)?,
            dim_texel_len: shader_int(dim_size_padded.div_ceil(TEXEL_WIDTH), physical_shape)?,
            padding: shader_int(padding, physical_shape)?,
        })
    }
}

/// Every payload that describes one layout of a tensor. Computing them up front lets a resize
/// fail before anything about the tensor changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LayoutParams {
    pub(crate) shape: ShapeParams,
    pub(crate) extents: ExtentParams,
    pub(crate) packing: PackingParams,
}

impl LayoutParams {
    pub(crate) fn new(
        shape: &[usize],
        physical_shape: &[usize],
        virtual_extents: Extent3D,
        packing: PackingPolicy,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            shape: ShapeParams::new(shape)?,
            extents: ExtentParams::new(virtual_extents)?,
            packing: PackingParams::new(shape, physical_shape, packing)?,
        })
    }
}

/// A parameter buffer that is created the first time it is requested and updated in place
/// afterwards.
pub(crate) struct ParamSlot<D: StorageDevice> {
    buffer: Option<D::ParamBuffer>,
}

impl<D: StorageDevice> Default for ParamSlot<D> {
    fn default() -> Self {
        Self { buffer: None }
    }
}

impl<D: StorageDevice> ParamSlot<D> {
    pub(crate) fn get_or_create<T: Pod>(
        &mut self,
        device: &D,
        contents: &T,
    ) -> Result<&D::ParamBuffer, StorageError> {
        let buffer = match self.buffer.take() {
            Some(buffer) => buffer,
            None => device.create_param_buffer(bytemuck::bytes_of(contents))?,
        };
        Ok(&*self.buffer.insert(buffer))
    }

    /// Refresh the contents of the buffer if it has been created.
    pub(crate) fn update<T: Pod>(&self, device: &D, contents: &T) {
        if let Some(buffer) = &self.buffer {
            device.update_param_buffer(buffer, bytemuck::bytes_of(contents));
        }
    }

    pub(crate) fn is_created(&self) -> bool {
        self.buffer.is_some()
    }
}
