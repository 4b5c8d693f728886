use serde::{Deserialize, Serialize};
use std::fmt;

/// A syscall number and its six raw arguments, as staged in registers.
/// 32-bit guests see each value masked to 32 bits on extraction.
#[derive(Copy, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SyscallParams {
    pub nr: u64,
    pub args: [u64; 6],
}

impl SyscallParams {
    pub fn new(nr: u64, args: [u64; 6]) -> SyscallParams {
        SyscallParams { nr, args }
    }

    pub fn syscall(&self) -> i64 {
        self.nr as i64
    }

    pub fn arg(&self, i: usize) -> u64 {
        self.args[i]
    }
}

impl fmt::Debug for SyscallParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "syscall {} {{{:#x}, {:#x}, {:#x}, {:#x}, {:#x}, {:#x}}}",
            self.nr,
            self.args[0],
            self.args[1],
            self.args[2],
            self.args[3],
            self.args[4],
            self.args[5]
        )
    }
}
