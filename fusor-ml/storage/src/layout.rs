//! Mapping from logical tensor shapes to the physical shape and image extents used on the GPU.
//!
//! When a tensor is stored in an image, one dimension is padded to the next multiple of 4 so
//! each texel holds a `vec4` of that dimension. Which dimension is chosen by the
//! [`PackingPolicy`]. Batches and channels are folded together into the depth of the image.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::StorageError;

/// Number of elements stored in one texel along the packed dimension.
pub const TEXEL_WIDTH: usize = 4;

/// The kind of GPU resource backing a tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageKind {
    Linear,
    Image2D,
    Image3D,
}

impl StorageKind {
    pub fn is_image(&self) -> bool {
        !matches!(self, StorageKind::Linear)
    }
}

/// Selects the dimension, counted from the innermost, that is packed into texels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PackingPolicy {
    /// Pack the last dimension (width)
    WidthPacked,
    /// Pack the second to last dimension (height)
    HeightPacked,
    /// Pack the third to last dimension (channels)
    ChannelsPacked,
}

impl PackingPolicy {
    /// The index of the packed dimension counted from the innermost dimension. This is also the
    /// axis of [`Extent3D`] the packed dimension is laid out along.
    pub fn packed_dim(&self) -> usize {
        match self {
            PackingPolicy::WidthPacked => 0,
            PackingPolicy::HeightPacked => 1,
            PackingPolicy::ChannelsPacked => 2,
        }
    }
}

/// The size of an image in texels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Extent3D {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent3D {
    pub const ZERO: Self = Self::new(0, 0, 0);

    pub const fn new(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    pub fn to_array(self) -> [u32; 3] {
        [self.width, self.height, self.depth]
    }

    /// Check if an image of this size fits inside an image of size `other` on every axis.
    pub fn fits_within(&self, other: &Extent3D) -> bool {
        self.width <= other.width && self.height <= other.height && self.depth <= other.depth
    }
}

impl Display for Extent3D {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.width, self.height, self.depth)
    }
}

pub fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// Index a shape from the end. `val_at(-1, shape)` is the innermost dimension. Missing
/// leading dimensions are treated as 1.
pub fn val_at(index: isize, shape: &[usize]) -> usize {
    debug_assert!(index < 0);
    let from_end = index.unsigned_abs();
    if from_end > shape.len() {
        1
    } else {
        shape[shape.len() - from_end]
    }
}

/// The number of elements in a shape. Shapes returned by [`compute_physical_shape`] never
/// overflow, along with every logical shape they were computed from.
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// The number of elements in a shape, or `None` if it overflows `usize`.
pub fn checked_numel(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}

/// Compute the shape of the memory that backs a tensor with the given logical shape.
///
/// Linear storage keeps the logical shape. Image storage always produces a rank 4
/// `(batch, channels, height, width)` shape with the packed dimension aligned to 4.
pub fn compute_physical_shape(
    logical_shape: &[usize],
    packing: PackingPolicy,
    storage_kind: StorageKind,
) -> Result<Box<[usize]>, StorageError> {
    if logical_shape.iter().any(|&dim| dim > i32::MAX as usize) {
        return Err(StorageError::invalid_shape(
            logical_shape,
            "dimensions must fit in a signed 32 bit integer",
        ));
    }

    let physical: Box<[usize]> = if storage_kind.is_image() {
        if logical_shape.len() > 4 {
            return Err(StorageError::invalid_shape(
                logical_shape,
                "image storage is only valid for tensors with rank 0 to 4",
            ));
        }

        let mut physical: Box<[usize]> = (-4..0).map(|i| val_at(i, logical_shape)).collect();
        let packed = physical.len() - 1 - packing.packed_dim();
        physical[packed] = align_up(physical[packed], TEXEL_WIDTH);
        if physical[packed] > i32::MAX as usize {
            return Err(StorageError::invalid_shape(
                logical_shape,
                "the padded packed dimension must fit in a signed 32 bit integer",
            ));
        }
        physical
    } else {
        logical_shape.into()
    };

    if checked_numel(&physical).is_none() {
        return Err(StorageError::invalid_shape(
            logical_shape,
            "the number of elements overflows usize",
        ));
    }

    Ok(physical)
}

/// Compute the extents of the image that stores a tensor with the given physical shape.
/// Linear storage has no extents.
pub fn compute_extents(
    physical_shape: &[usize],
    storage_kind: StorageKind,
    packing: PackingPolicy,
) -> Result<Extent3D, StorageError> {
    if !storage_kind.is_image() {
        return Ok(Extent3D::ZERO);
    }

    let &[batch, channels, height, width] = physical_shape else {
        return Err(StorageError::invalid_shape(
            physical_shape,
            "image extents require a rank 4 physical shape",
        ));
    };

    let packed = physical_shape[physical_shape.len() - 1 - packing.packed_dim()];
    if packed % TEXEL_WIDTH != 0 {
        return Err(StorageError::MisalignedPackedDim {
            shape: physical_shape.into(),
        });
    }

    let mut axes = [width, height, channels];
    axes[packing.packed_dim()] /= TEXEL_WIDTH;
    let [width, height, channels] = axes;

    // Extents are handed to shaders as i32
    let too_large = || {
        StorageError::invalid_shape(
            physical_shape,
            "image extents must fit in a signed 32 bit integer",
        )
    };
    let depth = batch.checked_mul(channels).ok_or_else(too_large)?;
    let axis = |value: usize| {
        i32::try_from(value)
            .map(|value| value as u32)
            .map_err(|_| too_large())
    };

    Ok(Extent3D::new(axis(width)?, axis(height)?, axis(depth)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PACKINGS: [PackingPolicy; 3] = [
        PackingPolicy::WidthPacked,
        PackingPolicy::HeightPacked,
        PackingPolicy::ChannelsPacked,
    ];

    #[test]
    fn channels_packed_image() {
        let physical =
            compute_physical_shape(&[2, 3, 4, 5], PackingPolicy::ChannelsPacked, StorageKind::Image3D)
                .unwrap();
        assert_eq!(&*physical, &[2, 4, 4, 5]);

        let extents =
            compute_extents(&physical, StorageKind::Image3D, PackingPolicy::ChannelsPacked).unwrap();
        assert_eq!(extents, Extent3D::new(5, 4, 2));
    }

    #[test]
    fn width_and_height_packed_extents() {
        let physical =
            compute_physical_shape(&[3, 5, 7], PackingPolicy::WidthPacked, StorageKind::Image3D)
                .unwrap();
        assert_eq!(&*physical, &[1, 3, 5, 8]);
        let extents =
            compute_extents(&physical, StorageKind::Image3D, PackingPolicy::WidthPacked).unwrap();
        assert_eq!(extents, Extent3D::new(2, 5, 3));

        let physical =
            compute_physical_shape(&[3, 5, 7], PackingPolicy::HeightPacked, StorageKind::Image2D)
                .unwrap();
        assert_eq!(&*physical, &[1, 3, 8, 7]);
        let extents =
            compute_extents(&physical, StorageKind::Image2D, PackingPolicy::HeightPacked).unwrap();
        assert_eq!(extents, Extent3D::new(7, 2, 3));
    }

    #[test]
    fn image_shapes_are_rank_four_and_aligned() {
        let shapes: [&[usize]; 6] = [&[], &[7], &[6, 1], &[5, 9, 2], &[2, 3, 4, 5], &[1, 1, 1, 1]];
        for shape in shapes {
            for packing in PACKINGS {
                let physical =
                    compute_physical_shape(shape, packing, StorageKind::Image3D).unwrap();
                assert_eq!(physical.len(), 4);

                let packed = 3 - packing.packed_dim();
                for (axis, &dim) in physical.iter().enumerate() {
                    let logical = val_at(axis as isize - 4, shape);
                    if axis == packed {
                        assert_eq!(dim % TEXEL_WIDTH, 0);
                        assert!(dim >= logical && dim - logical < TEXEL_WIDTH);
                    } else {
                        assert_eq!(dim, logical);
                    }
                }

                compute_extents(&physical, StorageKind::Image3D, packing).unwrap();
            }
        }
    }

    #[test]
    fn linear_is_identity() {
        let shapes: [&[usize]; 4] = [&[], &[3], &[2, 3, 5], &[1, 2, 3, 4, 5, 6]];
        for shape in shapes {
            for packing in PACKINGS {
                let physical =
                    compute_physical_shape(shape, packing, StorageKind::Linear).unwrap();
                assert_eq!(&*physical, shape);
                assert_eq!(
                    compute_extents(&physical, StorageKind::Linear, packing).unwrap(),
                    Extent3D::ZERO
                );
            }
        }
    }

    #[test]
    fn rank_above_four_is_rejected_for_images() {
        let result = compute_physical_shape(
            &[1, 2, 3, 4, 5],
            PackingPolicy::WidthPacked,
            StorageKind::Image2D,
        );
        assert!(matches!(result, Err(StorageError::InvalidShape { .. })));

        let result = compute_extents(&[4, 4], StorageKind::Image3D, PackingPolicy::WidthPacked);
        assert!(matches!(result, Err(StorageError::InvalidShape { .. })));
    }

    #[test]
    fn misaligned_packed_dim() {
        let result =
            compute_extents(&[1, 3, 4, 4], StorageKind::Image3D, PackingPolicy::ChannelsPacked);
        assert!(matches!(result, Err(StorageError::MisalignedPackedDim { .. })));
    }

    #[test]
    fn element_count_overflow_is_rejected() {
        let huge = [i32::MAX as usize; 3];
        let result = compute_physical_shape(&huge, PackingPolicy::WidthPacked, StorageKind::Linear);
        assert!(matches!(result, Err(StorageError::InvalidShape { .. })));

        let aligned = [i32::MAX as usize - 3; 4];
        let result =
            compute_physical_shape(&aligned, PackingPolicy::WidthPacked, StorageKind::Image3D);
        assert!(matches!(result, Err(StorageError::InvalidShape { .. })));

        assert_eq!(checked_numel(&huge), None);
        assert_eq!(checked_numel(&[2, 3, 4]), Some(24));
        assert_eq!(checked_numel(&[]), Some(1));
    }

    #[test]
    fn padded_packed_dim_must_fit_in_i32() {
        let result = compute_physical_shape(
            &[i32::MAX as usize],
            PackingPolicy::WidthPacked,
            StorageKind::Image3D,
        );
        assert!(matches!(result, Err(StorageError::InvalidShape { .. })));

        // Already aligned, so padding does not grow it
        let largest = i32::MAX as usize - 3;
        let physical =
            compute_physical_shape(&[largest], PackingPolicy::WidthPacked, StorageKind::Image3D)
                .unwrap();
        assert_eq!(&*physical, &[1, 1, 1, largest]);
    }

    #[test]
    fn extents_must_fit_in_i32() {
        let channels = 1 << 16;
        let result = compute_extents(
            &[1 << 16, channels, 1, 4],
            StorageKind::Image3D,
            PackingPolicy::WidthPacked,
        );
        assert!(matches!(result, Err(StorageError::InvalidShape { .. })));
    }

    #[test]
    fn val_at_pads_leading_dims() {
        assert_eq!(val_at(-1, &[2, 3]), 3);
        assert_eq!(val_at(-2, &[2, 3]), 2);
        assert_eq!(val_at(-3, &[2, 3]), 1);
        assert_eq!(val_at(-1, &[]), 1);
    }
}
