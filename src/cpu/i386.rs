//! i386 thread state on a 64-bit host: the trace primitive always speaks the
//! native 64-bit register block, so loads narrow and stores widen. The FP
//! block stays the fxsave image the host delivers.

use crate::errors::{GuestError, Result};
use crate::guest_ptr::GuestPtr;
use crate::kernel_abi::{x64, x86};
use crate::syscall_params::SyscallParams;
use memoffset::offset_of;
use nix::unistd::Pid;

#[derive(Copy, Clone, Default)]
pub struct I386Cpu {
    pub regs: x86::user_regs_struct,
    pub fpregs: x64::user_fpregs_struct,
}

impl I386Cpu {
    #[cfg(target_arch = "x86_64")]
    pub fn load(&mut self, pid: Pid) -> Result<()> {
        use crate::errors::trace_err;
        use crate::kernel_abi::narrow_x64;
        let native = nix::sys::ptrace::getregs(pid).map_err(trace_err("getregs"))?;
        let wide: x64::user_regs_struct = unsafe { std::mem::transmute(native) };
        self.regs = narrow_x64(&wide);
        super::get_fpregs_raw(pid, &mut self.fpregs)?;
        Ok(())
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn load(&mut self, _pid: Pid) -> Result<()> {
        Err(GuestError::Unsupported("i386 register fetch on this host"))
    }

    #[cfg(target_arch = "x86_64")]
    pub fn flush(&self, pid: Pid) -> Result<()> {
        use crate::errors::trace_err;
        use crate::kernel_abi::widen_x86_into;
        // Re-read the native block so the bits the i386 view does not carry
        // (fs_base and friends) survive the store.
        let native = nix::sys::ptrace::getregs(pid).map_err(trace_err("getregs"))?;
        let mut wide: x64::user_regs_struct = unsafe { std::mem::transmute(native) };
        widen_x86_into(&self.regs, &mut wide);
        let back: libc::user_regs_struct = unsafe { std::mem::transmute(wide) };
        nix::sys::ptrace::setregs(pid, back).map_err(trace_err("setregs"))
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn flush(&self, _pid: Pid) -> Result<()> {
        Err(GuestError::Unsupported("i386 register store on this host"))
    }

    pub fn pc(&self) -> GuestPtr {
        GuestPtr(self.regs.eip as u32 as u64)
    }

    pub fn set_pc(&mut self, pc: GuestPtr) {
        self.regs.eip = pc.as_u64() as i32;
    }

    pub fn sp(&self) -> GuestPtr {
        GuestPtr(self.regs.esp as u32 as u64)
    }

    pub fn set_sp(&mut self, sp: GuestPtr) {
        self.regs.esp = sp.as_u64() as i32;
    }

    pub fn orig_syscallno(&self) -> i64 {
        self.regs.orig_eax as i64
    }

    pub fn set_syscallno(&mut self, nr: i64) {
        self.regs.eax = nr as i32;
        self.regs.orig_eax = nr as i32;
    }

    pub fn stage_syscall(&mut self, sp: &SyscallParams) {
        self.regs.eax = sp.nr as i32;
        self.regs.ebx = sp.args[0] as i32;
        self.regs.ecx = sp.args[1] as i32;
        self.regs.edx = sp.args[2] as i32;
        self.regs.esi = sp.args[3] as i32;
        self.regs.edi = sp.args[4] as i32;
        self.regs.ebp = sp.args[5] as i32;
    }

    pub fn result(&self) -> u64 {
        self.regs.eax as u32 as u64
    }

    pub fn raw(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                &self.regs as *const x86::user_regs_struct as *const u8,
                std::mem::size_of::<x86::user_regs_struct>(),
            )
        }
    }

    pub fn raw_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                &mut self.regs as *mut x86::user_regs_struct as *mut u8,
                std::mem::size_of::<x86::user_regs_struct>(),
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

/// int 0x80 (0xcd 0x80) or sysenter (0x0f 0x34), whichever entry convention
/// the process uses.
pub fn is_syscall_op(word: u64) -> bool {
    let low = word & 0xffff;
    low == 0x80cd || low == 0x340f
}

pub fn name_to_offset(name: &str) -> Result<usize> {
    let off = match name {
        "ebx" => offset_of!(x86::user_regs_struct, ebx),
        "ecx" => offset_of!(x86::user_regs_struct, ecx),
        "edx" => offset_of!(x86::user_regs_struct, edx),
        "esi" => offset_of!(x86::user_regs_struct, esi),
        "edi" => offset_of!(x86::user_regs_struct, edi),
        "ebp" => offset_of!(x86::user_regs_struct, ebp),
        "eax" => offset_of!(x86::user_regs_struct, eax),
        "xds" => offset_of!(x86::user_regs_struct, xds),
        "xes" => offset_of!(x86::user_regs_struct, xes),
        "xfs" => offset_of!(x86::user_regs_struct, xfs),
        "xgs" => offset_of!(x86::user_regs_struct, xgs),
        "orig_eax" => offset_of!(x86::user_regs_struct, orig_eax),
        "eip" => offset_of!(x86::user_regs_struct, eip),
        "xcs" => offset_of!(x86::user_regs_struct, xcs),
        "eflags" => offset_of!(x86::user_regs_struct, eflags),
        "esp" => offset_of!(x86::user_regs_struct, esp),
        "xss" => offset_of!(x86::user_regs_struct, xss),
        _ => return Err(GuestError::UnknownRegister(name.to_owned())),
    };
    Ok(off)
}
