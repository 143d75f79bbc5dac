use kernel_alloc::{AllocationError, FrameError, StoreError, SwapError};
use kernel_info::{ConfigError, Pid};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{AddressSpaceError, ProtectionError, TranslateError, TranslationError};

/// Everything a [`MemoryManager`](crate::MemoryManager) operation can fail with.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Translation(#[from] TranslationError),
    #[error(transparent)]
    Protection(#[from] ProtectionError),
    #[error(transparent)]
    AddressSpace(#[from] AddressSpaceError),
    #[error(transparent)]
    Swap(#[from] SwapError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// A page fault that could not be resolved. The page is left as it was.
    #[error("unresolvable page fault at {address} for {pid}: {source}")]
    Fault {
        pid: Pid,
        address: VirtualAddress,
        #[source]
        source: Box<MemoryError>,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("memory dump: {0}")]
    Dump(#[from] std::io::Error),
    #[error("internal inconsistency: {0}")]
    Invariant(&'static str),
    #[error("operation requires an idle memory manager; {0} processes still own memory")]
    Busy(usize),
}

impl From<TranslateError> for MemoryError {
    fn from(e: TranslateError) -> Self {
        match e {
            TranslateError::Translation(e) => Self::Translation(e),
            TranslateError::Protection(e) => Self::Protection(e),
            TranslateError::PageFault(f) => Self::Fault {
                pid: f.pid,
                address: f.address,
                source: Box::new(Self::Invariant("page fault left unresolved")),
            },
            TranslateError::CopyOnWrite { pid, address, .. } => Self::Fault {
                pid,
                address,
                source: Box::new(Self::Invariant("copy-on-write left unresolved")),
            },
        }
    }
}

impl MemoryError {
    pub(crate) fn fault(pid: Pid, address: VirtualAddress, source: Self) -> Self {
        match source {
            e @ Self::Fault { .. } => e,
            e => Self::Fault {
                pid,
                address,
                source: Box::new(e),
            },
        }
    }

    /// `true` for errors caused by running out of frames or swap.
    #[must_use]
    pub const fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::Allocation(AllocationError::OutOfMemory { .. } | AllocationError::Frame(FrameError::OutOfFrames))
                | Self::Frame(FrameError::OutOfFrames)
                | Self::Swap(SwapError::Exhausted)
        )
    }
}
