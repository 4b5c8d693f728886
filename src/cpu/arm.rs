//! ARM thread state. Live register traffic only exists on an ARM host; on
//! other hosts the buffer still round-trips through snapshots.

use crate::errors::{GuestError, Result};
use crate::guest_ptr::GuestPtr;
use crate::kernel_abi::arm;
use crate::syscall_params::SyscallParams;
use nix::unistd::Pid;

const SP: usize = 13;
const PC: usize = 15;
const CPSR: usize = 16;
const ORIG_R0: usize = 17;

#[derive(Copy, Clone, Default)]
pub struct ArmCpu {
    pub regs: arm::user_regs,
}

impl ArmCpu {
    #[cfg(target_arch = "arm")]
    pub fn load(&mut self, pid: Pid) -> Result<()> {
        let rc = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGS,
                pid.as_raw(),
                0 as *mut libc::c_void,
                &mut self.regs as *mut arm::user_regs as *mut libc::c_void,
            )
        };
        if rc == -1 {
            return Err(GuestError::TraceFailed {
                op: "getregs",
                errno: nix::Error::Sys(nix::errno::Errno::last()),
            });
        }
        Ok(())
    }

    #[cfg(not(target_arch = "arm"))]
    pub fn load(&mut self, _pid: Pid) -> Result<()> {
        Err(GuestError::Unsupported("arm register fetch on this host"))
    }

    #[cfg(target_arch = "arm")]
    pub fn flush(&self, pid: Pid) -> Result<()> {
        let rc = unsafe {
            libc::ptrace(
                libc::PTRACE_SETREGS,
                pid.as_raw(),
                0 as *mut libc::c_void,
                &self.regs as *const arm::user_regs as *mut libc::c_void,
            )
        };
        if rc == -1 {
            return Err(GuestError::TraceFailed {
                op: "setregs",
                errno: nix::Error::Sys(nix::errno::Errno::last()),
            });
        }
        Ok(())
    }

    #[cfg(not(target_arch = "arm"))]
    pub fn flush(&self, _pid: Pid) -> Result<()> {
        Err(GuestError::Unsupported("arm register store on this host"))
    }

    pub fn pc(&self) -> GuestPtr {
        GuestPtr(self.regs.uregs[PC] as u64)
    }

    pub fn set_pc(&mut self, pc: GuestPtr) {
        self.regs.uregs[PC] = pc.as_u64() as u32;
    }

    pub fn sp(&self) -> GuestPtr {
        GuestPtr(self.regs.uregs[SP] as u64)
    }

    pub fn set_sp(&mut self, sp: GuestPtr) {
        self.regs.uregs[SP] = sp.as_u64() as u32;
    }

    pub fn orig_syscallno(&self) -> i64 {
        // EABI carries the number in r7
        self.regs.uregs[7] as i64
    }

    pub fn set_syscallno(&mut self, nr: i64) {
        self.regs.uregs[7] = nr as u32;
    }

    pub fn stage_syscall(&mut self, sp: &SyscallParams) {
        self.regs.uregs[7] = sp.nr as u32;
        for i in 0..6 {
            self.regs.uregs[i] = sp.args[i] as u32;
        }
    }

    pub fn result(&self) -> u64 {
        self.regs.uregs[0] as u64
    }

    pub fn raw(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                &self.regs as *const arm::user_regs as *const u8,
                std::mem::size_of::<arm::user_regs>(),
            )
        }
    }

    pub fn raw_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                &mut self.regs as *mut arm::user_regs as *mut u8,
                std::mem::size_of::<arm::user_regs>(),
            )
        }
    }
}

/// svc (condition-always).
pub fn is_syscall_op(word: u64) -> bool {
    (word as u32) >> 24 == 0xef
}

pub fn name_to_offset(name: &str) -> Result<usize> {
    let idx = match name {
        "r0" => 0,
        "r1" => 1,
        "r2" => 2,
        "r3" => 3,
        "r4" => 4,
        "r5" => 5,
        "r6" => 6,
        "r7" => 7,
        "r8" => 8,
        "r9" => 9,
        "r10" => 10,
        "r11" | "fp" => 11,
        "r12" | "ip" => 12,
        "r13" | "sp" => SP,
        "r14" | "lr" => 14,
        "r15" | "pc" => PC,
        "cpsr" => CPSR,
        "orig_r0" => ORIG_R0,
        _ => return Err(GuestError::UnknownRegister(name.to_owned())),
    };
    Ok(idx * 4)
}
