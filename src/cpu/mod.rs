//! Per-thread CPU state: a snapshot of the tracee's registers plus the
//! operations that need to know the architecture — breakpoint insertion and
//! rollback, syscall-op recognition, register-name resolution, and dispatch
//! of a staged syscall through a single step of the child.
//!
//! The buffer reflects the thread's registers exactly while the thread is
//! stopped; once the thread runs it is stale and must be reloaded before any
//! read.

pub mod amd64;
pub mod arm;
pub mod i386;

use crate::errors::{trace_err, GuestError, Result};
use crate::guest_ptr::GuestPtr;
use crate::kernel_abi::Arch;
use crate::kernel_metadata::nop_syscall_nr;
use crate::syscall_params::SyscallParams;
use nix::sys::ptrace;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

pub use amd64::Amd64Cpu;
pub use arm::ArmCpu;
pub use i386::I386Cpu;

/// Width of the trace primitive's data word on this host.
pub(crate) const WORD_SIZE: usize = std::mem::size_of::<libc::c_long>();

/// ARM permanently-undefined instruction, the kernel's breakpoint word.
const ARM_BKPT_WORD: u64 = 0xe7f0_01f0;

pub(crate) fn peek_word(pid: Pid, addr: GuestPtr) -> Result<u64> {
    let v = ptrace::read(pid, addr.as_usize() as ptrace::AddressType).map_err(trace_err("peek"))?;
    Ok(v as u64)
}

pub(crate) fn poke_word(pid: Pid, addr: GuestPtr, word: u64) -> Result<()> {
    unsafe {
        ptrace::write(
            pid,
            addr.as_usize() as ptrace::AddressType,
            word as usize as *mut libc::c_void,
        )
    }
    .map_err(trace_err("poke"))
}

/// Block until the thread reports a stop (or death) through the wait
/// primitive.
pub(crate) fn wait_stop(pid: Pid) -> Result<WaitStatus> {
    waitpid(pid, Some(WaitPidFlag::__WALL)).map_err(trace_err("wait"))
}

/// Fetch the FP block. nix has no wrapper for PTRACE_GETFPREGS.
#[cfg(target_arch = "x86_64")]
pub(crate) fn get_fpregs_raw(
    pid: Pid,
    out: &mut crate::kernel_abi::x64::user_fpregs_struct,
) -> Result<()> {
    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_GETFPREGS,
            pid.as_raw(),
            0 as *mut libc::c_void,
            out as *mut crate::kernel_abi::x64::user_fpregs_struct as *mut libc::c_void,
        )
    };
    if rc == -1 {
        return Err(GuestError::TraceFailed {
            op: "getfpregs",
            errno: nix::Error::Sys(nix::errno::Errno::last()),
        });
    }
    Ok(())
}

/// What set_breakpoint displaced, so the next stop can put it back.
#[derive(Copy, Clone, Debug)]
pub struct BreakpointUndo {
    pub addr: GuestPtr,
    pub displaced: u64,
}

#[derive(Copy, Clone)]
pub enum ArchCpu {
    Amd64(Amd64Cpu),
    I386(I386Cpu),
    Arm(ArmCpu),
}

pub struct CpuState {
    pid: Pid,
    undo: Option<BreakpointUndo>,
    cpu: ArchCpu,
}

impl CpuState {
    pub fn new(arch: Arch, pid: Pid) -> CpuState {
        let cpu = match arch {
            Arch::X86_64 => ArchCpu::Amd64(Amd64Cpu::default()),
            Arch::I386 => ArchCpu::I386(I386Cpu::default()),
            Arch::Arm => ArchCpu::Arm(ArmCpu::default()),
        };
        CpuState {
            pid,
            undo: None,
            cpu,
        }
    }

    pub fn arch(&self) -> Arch {
        match self.cpu {
            ArchCpu::Amd64(_) => Arch::X86_64,
            ArchCpu::I386(_) => Arch::I386,
            ArchCpu::Arm(_) => Arch::Arm,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Adopt another state's register contents (not its pid). Used when a
    /// fresh child is populated from a captured Guest.
    pub fn copy_arch_state(&mut self, other: &CpuState) {
        self.cpu = other.cpu;
    }

    /// Pull registers from the stopped thread into the local buffer.
    pub fn load_regs(&mut self) -> Result<()> {
        let pid = self.pid;
        match &mut self.cpu {
            ArchCpu::Amd64(c) => c.load(pid),
            ArchCpu::I386(c) => c.load(pid),
            ArchCpu::Arm(c) => c.load(pid),
        }
    }

    /// Push the local buffer back into the stopped thread.
    pub fn flush_regs(&self) -> Result<()> {
        let pid = self.pid;
        match &self.cpu {
            ArchCpu::Amd64(c) => c.flush(pid),
            ArchCpu::I386(c) => c.flush(pid),
            ArchCpu::Arm(c) => c.flush(pid),
        }
    }

    pub fn pc(&self) -> GuestPtr {
        match &self.cpu {
            ArchCpu::Amd64(c) => c.pc(),
            ArchCpu::I386(c) => c.pc(),
            ArchCpu::Arm(c) => c.pc(),
        }
    }

    pub fn set_pc(&mut self, pc: GuestPtr) {
        match &mut self.cpu {
            ArchCpu::Amd64(c) => c.set_pc(pc),
            ArchCpu::I386(c) => c.set_pc(pc),
            ArchCpu::Arm(c) => c.set_pc(pc),
        }
    }

    pub fn stack_ptr(&self) -> GuestPtr {
        match &self.cpu {
            ArchCpu::Amd64(c) => c.sp(),
            ArchCpu::I386(c) => c.sp(),
            ArchCpu::Arm(c) => c.sp(),
        }
    }

    pub fn set_stack_ptr(&mut self, sp: GuestPtr) {
        match &mut self.cpu {
            ArchCpu::Amd64(c) => c.set_sp(sp),
            ArchCpu::I386(c) => c.set_sp(sp),
            ArchCpu::Arm(c) => c.set_sp(sp),
        }
    }

    /// The syscall number as the kernel latched it at a syscall stop.
    pub fn orig_syscallno(&self) -> i64 {
        match &self.cpu {
            ArchCpu::Amd64(c) => c.orig_syscallno(),
            ArchCpu::I386(c) => c.orig_syscallno(),
            ArchCpu::Arm(c) => c.orig_syscallno(),
        }
    }

    /// Raw general-register buffer; the ABI adapter indexes into this by the
    /// offsets `name_to_offset` hands out.
    pub fn state_data(&self) -> &[u8] {
        match &self.cpu {
            ArchCpu::Amd64(c) => c.raw(),
            ArchCpu::I386(c) => c.raw(),
            ArchCpu::Arm(c) => c.raw(),
        }
    }

    pub fn state_data_mut(&mut self) -> &mut [u8] {
        match &mut self.cpu {
            ArchCpu::Amd64(c) => c.raw_mut(),
            ArchCpu::I386(c) => c.raw_mut(),
            ArchCpu::Arm(c) => c.raw_mut(),
        }
    }

    /// FP-register buffer; x86 families only.
    pub fn fp_data(&self) -> Option<&[u8]> {
        match &self.cpu {
            ArchCpu::Amd64(c) => Some(c.fp_raw()),
            ArchCpu::I386(c) => Some(c.fp_raw()),
            ArchCpu::Arm(_) => None,
        }
    }

    pub fn fp_data_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.cpu {
            ArchCpu::Amd64(c) => Some(c.fp_raw_mut()),
            ArchCpu::I386(c) => Some(c.fp_raw_mut()),
            ArchCpu::Arm(_) => None,
        }
    }

    /// Resolve a register's symbolic name to its byte offset inside the raw
    /// buffer.
    pub fn name_to_offset(&self, name: &str) -> Result<usize> {
        match self.cpu {
            ArchCpu::Amd64(_) => amd64::name_to_offset(name),
            ArchCpu::I386(_) => i386::name_to_offset(name),
            ArchCpu::Arm(_) => arm::name_to_offset(name),
        }
    }

    /// True iff the word fetched at a stop site begins with this arch's
    /// syscall encoding.
    pub fn is_syscall_op(&self, _addr: GuestPtr, word: u64) -> bool {
        match self.cpu {
            ArchCpu::Amd64(_) => amd64::is_syscall_op(word),
            ArchCpu::I386(_) => i386::is_syscall_op(word),
            ArchCpu::Arm(_) => arm::is_syscall_op(word),
        }
    }

    /// Write the arch's trap opcode at `addr` through a word-granular
    /// read-modify-write; remember and return what it displaced.
    pub fn set_breakpoint(&mut self, addr: GuestPtr) -> Result<u64> {
        let displaced = peek_word(self.pid, addr)?;
        let trap = match self.cpu {
            ArchCpu::Amd64(_) | ArchCpu::I386(_) => (displaced & !0xff) | 0xcc,
            ArchCpu::Arm(_) => {
                let keep = displaced & !0xffff_ffffu64;
                keep | ARM_BKPT_WORD
            }
        };
        poke_word(self.pid, addr, trap)?;
        self.undo = Some(BreakpointUndo { addr, displaced });
        Ok(displaced)
    }

    /// After a breakpoint trap: restore the displaced bytes and rewind the
    /// program counter to the breakpoint address. Idempotent; returns the
    /// null address when no breakpoint is pending.
    pub fn undo_breakpoint(&mut self) -> Result<GuestPtr> {
        let undo = match self.undo.take() {
            Some(u) => u,
            None => return Ok(GuestPtr::null()),
        };
        poke_word(self.pid, undo.addr, undo.displaced)?;
        self.load_regs()?;
        self.set_pc(undo.addr);
        self.flush_regs()?;
        Ok(undo.addr)
    }

    pub fn breakpoint_pending(&self) -> bool {
        self.undo.is_some()
    }

    /// Forget the undo entry for `addr` after an explicit reset restored it.
    pub(crate) fn clear_undo(&mut self, addr: GuestPtr) {
        if let Some(u) = self.undo {
            if u.addr == addr {
                self.undo = None;
            }
        }
    }

    /// Rewrite the staged syscall number to the arch's getpid so the child
    /// executes a no-op instead.
    pub fn ignore_syscall(&mut self) {
        self.set_syscallno(nop_syscall_nr(self.arch()));
    }

    pub fn set_syscallno(&mut self, nr: i64) {
        match &mut self.cpu {
            ArchCpu::Amd64(c) => c.set_syscallno(nr),
            ArchCpu::I386(c) => c.set_syscallno(nr),
            ArchCpu::Arm(c) => c.set_syscallno(nr),
        }
    }

    fn stage_syscall(&mut self, sp: &SyscallParams) {
        match &mut self.cpu {
            ArchCpu::Amd64(c) => c.stage_syscall(sp),
            ArchCpu::I386(c) => c.stage_syscall(sp),
            ArchCpu::Arm(c) => c.stage_syscall(sp),
        }
    }

    fn syscall_result(&self) -> u64 {
        match &self.cpu {
            ArchCpu::Amd64(c) => c.result(),
            ArchCpu::I386(c) => c.result(),
            ArchCpu::Arm(c) => c.result(),
        }
    }

    /// The word to poke when a syscall opcode has to be planted at a site
    /// that does not already carry one.
    fn syscall_insn_word(&self, displaced: u64) -> u64 {
        match self.cpu {
            ArchCpu::Amd64(_) => (displaced & !0xffffu64) | 0x050f,
            ArchCpu::I386(_) => (displaced & !0xffffu64) | 0x80cd,
            ArchCpu::Arm(_) => (displaced & !0xffff_ffffu64) | 0xef00_0000,
        }
    }

    /// Execute a syscall inside the child: stage the parameters into the
    /// arch's argument registers, single-step across the syscall instruction
    /// at the current program counter, and read the result register back.
    /// If the stop site carries no syscall opcode, one is planted for the
    /// step and restored afterwards. The caller's register file is put back
    /// either way.
    pub fn dispatch_syscall(&mut self, sp: &SyscallParams) -> Result<u64> {
        self.load_regs()?;
        let saved = self.cpu;
        let site = self.pc();
        let word = peek_word(self.pid, site)?;
        let planted = if self.is_syscall_op(site, word) {
            None
        } else {
            poke_word(self.pid, site, self.syscall_insn_word(word))?;
            Some(word)
        };

        let stepped = self.step_syscall_at(site, sp);

        if let Some(original) = planted {
            poke_word(self.pid, site, original)?;
        }
        let ret = stepped?;

        self.cpu = saved;
        self.flush_regs()?;
        Ok(ret)
    }

    fn step_syscall_at(&mut self, site: GuestPtr, sp: &SyscallParams) -> Result<u64> {
        self.stage_syscall(sp);
        self.flush_regs()?;
        ptrace::step(self.pid, None).map_err(trace_err("step"))?;
        wait_stop(self.pid)?;
        self.load_regs()?;

        let expected = site + self.arch().syscall_insn_len();
        let landed = self.pc();
        if landed != expected {
            return Err(GuestError::SyscallSiteMismatch {
                expected,
                found: landed,
            });
        }
        Ok(self.syscall_result())
    }

    /// Bulk store into the child, one data word at a time. `dest` must be
    /// word-aligned and `src` a whole number of words; the memory bridge's
    /// copy path guarantees both.
    pub fn copy_in(&self, dest: GuestPtr, src: &[u8]) -> Result<()> {
        debug_assert_eq!(dest.as_u64() as usize % WORD_SIZE, 0);
        debug_assert_eq!(src.len() % WORD_SIZE, 0);
        for (i, chunk) in src.chunks(WORD_SIZE).enumerate() {
            let mut w = [0u8; 8];
            w[..WORD_SIZE].copy_from_slice(chunk);
            poke_word(self.pid, dest + i * WORD_SIZE, u64::from_le_bytes(w))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_op_recognition() {
        let cpu = CpuState::new(Arch::X86_64, Pid::from_raw(1));
        assert!(cpu.is_syscall_op(GuestPtr(0), 0x050f)); // syscall
        assert!(cpu.is_syscall_op(GuestPtr(0), 0xdead_050f)); // prefix only
        assert!(!cpu.is_syscall_op(GuestPtr(0), 0x90c3));

        let cpu32 = CpuState::new(Arch::I386, Pid::from_raw(1));
        assert!(cpu32.is_syscall_op(GuestPtr(0), 0x80cd)); // int 0x80
        assert!(cpu32.is_syscall_op(GuestPtr(0), 0x340f)); // sysenter
        assert!(!cpu32.is_syscall_op(GuestPtr(0), 0x050f));

        let arm = CpuState::new(Arch::Arm, Pid::from_raw(1));
        assert!(arm.is_syscall_op(GuestPtr(0), 0xef00_0000)); // svc #0
        assert!(!arm.is_syscall_op(GuestPtr(0), 0xe3a0_0000));
    }

    #[test]
    fn register_offsets() {
        let cpu = CpuState::new(Arch::X86_64, Pid::from_raw(1));
        assert_eq!(cpu.name_to_offset("rax").unwrap(), 80);
        assert_eq!(cpu.name_to_offset("rdi").unwrap(), 112);
        assert_eq!(cpu.name_to_offset("rip").unwrap(), 128);
        assert!(cpu.name_to_offset("xyzzy").is_err());

        let cpu32 = CpuState::new(Arch::I386, Pid::from_raw(1));
        assert_eq!(cpu32.name_to_offset("ebx").unwrap(), 0);
        assert_eq!(cpu32.name_to_offset("eax").unwrap(), 24);

        let arm = CpuState::new(Arch::Arm, Pid::from_raw(1));
        assert_eq!(arm.name_to_offset("r0").unwrap(), 0);
        assert_eq!(arm.name_to_offset("r7").unwrap(), 28);
        assert_eq!(arm.name_to_offset("sp").unwrap(), 52);
        assert_eq!(arm.name_to_offset("pc").unwrap(), 60);
    }

    #[test]
    fn pc_and_state_data() {
        let mut cpu = CpuState::new(Arch::X86_64, Pid::from_raw(1));
        cpu.set_pc(GuestPtr(0x40_1000));
        assert_eq!(cpu.pc(), GuestPtr(0x40_1000));
        let off = cpu.name_to_offset("rip").unwrap();
        let raw = cpu.state_data();
        let mut b = [0u8; 8];
        b.copy_from_slice(&raw[off..off + 8]);
        assert_eq!(u64::from_le_bytes(b), 0x40_1000);
    }

    #[test]
    fn undo_without_breakpoint_is_null() {
        let mut cpu = CpuState::new(Arch::X86_64, Pid::from_raw(1));
        assert!(!cpu.breakpoint_pending());
        assert!(cpu.undo_breakpoint().unwrap().is_null());
    }
}
