//! Access history and the barriers required between GPU passes that touch the same resource.

use enumset::{EnumSet, EnumSetType};

use crate::Extent3D;

/// How a pass uses a resource.
#[derive(EnumSetType, Debug)]
pub enum AccessMode {
    Read,
    Write,
}

/// A point in the GPU pipeline a resource is used from.
#[derive(EnumSetType, Debug)]
pub enum PipelineStage {
    TopOfPipe,
    Compute,
    Transfer,
    Host,
    BottomOfPipe,
}

/// Memory access masks recorded in a barrier.
#[derive(EnumSetType, Debug)]
pub enum MemoryAccess {
    ShaderRead,
    ShaderWrite,
    TransferRead,
    TransferWrite,
    HostRead,
    HostWrite,
}

/// The layout an image must be in for a given kind of access.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    #[default]
    Undefined,
    General,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
}

impl ImageLayout {
    pub fn for_access(stage: PipelineStage, access: EnumSet<AccessMode>) -> Self {
        match stage {
            PipelineStage::Compute if access == EnumSet::only(AccessMode::Read) => {
                ImageLayout::ShaderReadOnly
            }
            PipelineStage::Transfer if access.contains(AccessMode::Write) => {
                ImageLayout::TransferDst
            }
            PipelineStage::Transfer => ImageLayout::TransferSrc,
            PipelineStage::TopOfPipe | PipelineStage::BottomOfPipe => ImageLayout::Undefined,
            _ => ImageLayout::General,
        }
    }
}

pub fn memory_access(
    stage: Option<PipelineStage>,
    access: EnumSet<AccessMode>,
) -> EnumSet<MemoryAccess> {
    let (read, write) = match stage {
        Some(PipelineStage::Compute) => (MemoryAccess::ShaderRead, MemoryAccess::ShaderWrite),
        Some(PipelineStage::Transfer) => (MemoryAccess::TransferRead, MemoryAccess::TransferWrite),
        Some(PipelineStage::Host) => (MemoryAccess::HostRead, MemoryAccess::HostWrite),
        _ => return EnumSet::empty(),
    };

    let mut mask = EnumSet::empty();
    if access.contains(AccessMode::Read) {
        mask |= read;
    }
    if access.contains(AccessMode::Write) {
        mask |= write;
    }
    mask
}

/// The most recent known use of a resource. An empty record means the resource has not been
/// used since it was allocated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccessRecord {
    pub stage: Option<PipelineStage>,
    pub access: EnumSet<AccessMode>,
}

impl AccessRecord {
    pub fn new(stage: PipelineStage, access: impl Into<EnumSet<AccessMode>>) -> Self {
        Self {
            stage: Some(stage),
            access: access.into(),
        }
    }

    pub fn written(&self) -> bool {
        self.access.contains(AccessMode::Write)
    }

    pub fn is_empty(&self) -> bool {
        self.stage.is_none() && self.access.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct ImageBarrier<I> {
    pub src_access: EnumSet<MemoryAccess>,
    pub dst_access: EnumSet<MemoryAccess>,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
    pub extents: Extent3D,
    pub image: I,
}

#[derive(Clone, Debug)]
pub struct BufferBarrier<B> {
    pub src_access: EnumSet<MemoryAccess>,
    pub dst_access: EnumSet<MemoryAccess>,
    pub buffer: B,
}

/// A pipeline barrier accumulated across every resource a pass touches. Each call to
/// [`crate::PhysicalStorage::request_access`] that needs synchronization adds its stages
/// and one image or buffer entry.
#[derive(Clone, Debug)]
pub struct PipelineBarrier<I, B> {
    pub src_stages: EnumSet<PipelineStage>,
    pub dst_stages: EnumSet<PipelineStage>,
    pub images: Vec<ImageBarrier<I>>,
    pub buffers: Vec<BufferBarrier<B>>,
}

impl<I, B> Default for PipelineBarrier<I, B> {
    fn default() -> Self {
        Self {
            src_stages: EnumSet::empty(),
            dst_stages: EnumSet::empty(),
            images: Vec::new(),
            buffers: Vec::new(),
        }
    }
}

impl<I, B> PipelineBarrier<I, B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.buffers.is_empty()
    }

    /// The number of resource barriers recorded.
    pub fn len(&self) -> usize {
        self.images.len() + self.buffers.len()
    }

    /// Record the execution dependency between the previous and the next use of a resource.
    pub(crate) fn add_stages(&mut self, previous: Option<PipelineStage>, next: PipelineStage) {
        self.src_stages |= previous.unwrap_or(PipelineStage::TopOfPipe);
        self.dst_stages |= match next {
            PipelineStage::TopOfPipe => PipelineStage::BottomOfPipe,
            stage => stage,
        };
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_reads_use_read_only_layout() {
        assert_eq!(
            ImageLayout::for_access(PipelineStage::Compute, AccessMode::Read.into()),
            ImageLayout::ShaderReadOnly
        );
        assert_eq!(
            ImageLayout::for_access(PipelineStage::Compute, AccessMode::Read | AccessMode::Write),
            ImageLayout::General
        );
        assert_eq!(
            ImageLayout::for_access(PipelineStage::Transfer, AccessMode::Write.into()),
            ImageLayout::TransferDst
        );
        assert_eq!(
            ImageLayout::for_access(PipelineStage::Transfer, AccessMode::Read.into()),
            ImageLayout::TransferSrc
        );
    }

    #[test]
    fn memory_access_masks() {
        assert_eq!(
            memory_access(Some(PipelineStage::Compute), AccessMode::Read | AccessMode::Write),
            MemoryAccess::ShaderRead | MemoryAccess::ShaderWrite
        );
        assert_eq!(
            memory_access(Some(PipelineStage::Host), AccessMode::Read.into()),
            EnumSet::only(MemoryAccess::HostRead)
        );
        assert!(memory_access(None, AccessMode::Write.into()).is_empty());
    }

    #[test]
    fn first_use_waits_on_top_of_pipe() {
        let mut barrier = PipelineBarrier::<(), ()>::new();
        barrier.add_stages(None, PipelineStage::Compute);
        assert_eq!(barrier.src_stages, EnumSet::only(PipelineStage::TopOfPipe));
        assert_eq!(barrier.dst_stages, EnumSet::only(PipelineStage::Compute));

        barrier.add_stages(Some(PipelineStage::Transfer), PipelineStage::Host);
        assert_eq!(barrier.src_stages, PipelineStage::TopOfPipe | PipelineStage::Transfer);
        assert_eq!(barrier.dst_stages, PipelineStage::Compute | PipelineStage::Host);
    }
}
