//! Notifications to the interrupt/signal collaborator.

use core::fmt;
use kernel_info::Pid;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::Access;

/// A signal raised by the memory subsystem against a process.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Signal {
    /// An access was denied and could not be resolved by copy-on-write.
    SegmentationFault {
        pid: Pid,
        address: VirtualAddress,
        access: Access,
    },
}

impl Signal {
    #[must_use]
    pub const fn pid(&self) -> Pid {
        match self {
            Self::SegmentationFault { pid, .. } => *pid,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SegmentationFault { pid, address, access } => {
                write!(f, "SIGSEGV to {pid}: {access} of {address}")
            }
        }
    }
}

/// Receiver of [`Signal`]s, implemented by whoever dispatches them to processes.
pub trait SignalSink: Send + Sync {
    fn deliver(&self, signal: Signal);
}

/// Logs every signal at error level and drops it.
#[derive(Debug, Default, Copy, Clone)]
pub struct LogSignals;

impl SignalSink for LogSignals {
    fn deliver(&self, signal: Signal) {
        log::error!("{signal}");
    }
}
