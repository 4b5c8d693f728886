//! x86-64 thread state. Registers load through the native GETREGS block;
//! the FP block is the raw fxsave image GETFPREGS delivers.

use crate::errors::{GuestError, Result};
use crate::guest_ptr::GuestPtr;
use crate::kernel_abi::x64;
use crate::syscall_params::SyscallParams;
use memoffset::offset_of;
use nix::unistd::Pid;

#[derive(Copy, Clone, Default)]
pub struct Amd64Cpu {
    pub regs: x64::user_regs_struct,
    pub fpregs: x64::user_fpregs_struct,
}

impl Amd64Cpu {
    #[cfg(target_arch = "x86_64")]
    pub fn load(&mut self, pid: Pid) -> Result<()> {
        use crate::errors::trace_err;
        let native = nix::sys::ptrace::getregs(pid).map_err(trace_err("getregs"))?;
        self.regs = unsafe { std::mem::transmute(native) };
        super::get_fpregs_raw(pid, &mut self.fpregs)?;
        Ok(())
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn load(&mut self, _pid: Pid) -> Result<()> {
        Err(GuestError::Unsupported("x86-64 register fetch on this host"))
    }

    #[cfg(target_arch = "x86_64")]
    pub fn flush(&self, pid: Pid) -> Result<()> {
        use crate::errors::trace_err;
        let native: libc::user_regs_struct = unsafe { std::mem::transmute(self.regs) };
        nix::sys::ptrace::setregs(pid, native).map_err(trace_err("setregs"))
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn flush(&self, _pid: Pid) -> Result<()> {
        Err(GuestError::Unsupported("x86-64 register store on this host"))
    }

    pub fn pc(&self) -> GuestPtr {
        GuestPtr(self.regs.rip)
    }

    pub fn set_pc(&mut self, pc: GuestPtr) {
        self.regs.rip = pc.as_u64();
    }

    pub fn sp(&self) -> GuestPtr {
        GuestPtr(self.regs.rsp)
    }

    pub fn set_sp(&mut self, sp: GuestPtr) {
        self.regs.rsp = sp.as_u64();
    }

    pub fn orig_syscallno(&self) -> i64 {
        self.regs.orig_rax as i64
    }

    pub fn set_syscallno(&mut self, nr: i64) {
        self.regs.rax = nr as u64;
        self.regs.orig_rax = nr as u64;
    }

    pub fn stage_syscall(&mut self, sp: &SyscallParams) {
        self.regs.rax = sp.nr;
        self.regs.rdi = sp.args[0];
        self.regs.rsi = sp.args[1];
        self.regs.rdx = sp.args[2];
        self.regs.r10 = sp.args[3];
        self.regs.r8 = sp.args[4];
        self.regs.r9 = sp.args[5];
    }

    pub fn result(&self) -> u64 {
        self.regs.rax
    }

    pub fn raw(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                &self.regs as *const x64::user_regs_struct as *const u8,
                std::mem::size_of::<x64::user_regs_struct>(),
            )
        }
    }

    pub fn raw_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                &mut self.regs as *mut x64::user_regs_struct as *mut u8,
                std::mem::size_of::<x64::user_regs_struct>(),
            )
        }
    }

    pub fn fp_raw(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                &self.fpregs as *const x64::user_fpregs_struct as *const u8,
                std::mem::size_of::<x64::user_fpregs_struct>(),
            )
        }
    }

    pub fn fp_raw_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                &mut self.fpregs as *mut x64::user_fpregs_struct as *mut u8,
                std::mem::size_of::<x64::user_fpregs_struct>(),
            )
        }
    }
}

/// The `syscall` instruction: 0x0f 0x05.
pub fn is_syscall_op(word: u64) -> bool {
    word & 0xffff == 0x050f
}

pub fn name_to_offset(name: &str) -> Result<usize> {
    let off = match name {
        "r15" => offset_of!(x64::user_regs_struct, r15),
        "r14" => offset_of!(x64::user_regs_struct, r14),
        "r13" => offset_of!(x64::user_regs_struct, r13),
        "r12" => offset_of!(x64::user_regs_struct, r12),
        "rbp" => offset_of!(x64::user_regs_struct, rbp),
        "rbx" => offset_of!(x64::user_regs_struct, rbx),
        "r11" => offset_of!(x64::user_regs_struct, r11),
        "r10" => offset_of!(x64::user_regs_struct, r10),
        "r9" => offset_of!(x64::user_regs_struct, r9),
        "r8" => offset_of!(x64::user_regs_struct, r8),
        "rax" => offset_of!(x64::user_regs_struct, rax),
        "rcx" => offset_of!(x64::user_regs_struct, rcx),
        "rdx" => offset_of!(x64::user_regs_struct, rdx),
        "rsi" => offset_of!(x64::user_regs_struct, rsi),
        "rdi" => offset_of!(x64::user_regs_struct, rdi),
        "orig_rax" => offset_of!(x64::user_regs_struct, orig_rax),
        "rip" => offset_of!(x64::user_regs_struct, rip),
        "cs" => offset_of!(x64::user_regs_struct, cs),
        "eflags" => offset_of!(x64::user_regs_struct, eflags),
        "rsp" => offset_of!(x64::user_regs_struct, rsp),
        "ss" => offset_of!(x64::user_regs_struct, ss),
        "fs_base" => offset_of!(x64::user_regs_struct, fs_base),
        "gs_base" => offset_of!(x64::user_regs_struct, gs_base),
        "ds" => offset_of!(x64::user_regs_struct, ds),
        "es" => offset_of!(x64::user_regs_struct, es),
        "fs" => offset_of!(x64::user_regs_struct, fs),
        "gs" => offset_of!(x64::user_regs_struct, gs),
        _ => return Err(GuestError::UnknownRegister(name.to_owned())),
    };
    Ok(off)
}
