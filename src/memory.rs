//! Resident memory measurement for the child process.
//!
//! CHANGELOG:
//! - 03/02/2026 - Initial implementation

use sysinfo::{Pid, System};

/// Reports the resident set size of a process.
pub trait MemoryProbe {
    /// Resident memory of `pid` in bytes, or `None` if it cannot be read.
    fn resident_bytes(&mut self, pid: u32) -> Option<u64>;
}

/// `MemoryProbe` backed by the OS process table.
pub struct SysinfoProbe {
    system: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn resident_bytes(&mut self, pid: u32) -> Option<u64> {
        let pid = Pid::from_u32(pid);
        if !self.system.refresh_process(pid) {
            return None;
        }
        self.system.process(pid).map(|p| p.memory())
    }
}
