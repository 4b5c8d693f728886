//! Architecture tags and the raw register-block layouts the trace primitive
//! trades in. The byte layout of these structs is the contract the ABI
//! adapter indexes into, so they mirror the kernel's field order exactly.

use crate::errors::{GuestError, Result};
use static_assertions::const_assert_eq;

#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Arch {
    I386,
    X86_64,
    Arm,
}

#[cfg(target_arch = "x86_64")]
pub const NATIVE_ARCH: Arch = Arch::X86_64;
#[cfg(target_arch = "x86")]
pub const NATIVE_ARCH: Arch = Arch::I386;
#[cfg(target_arch = "arm")]
pub const NATIVE_ARCH: Arch = Arch::Arm;

impl Arch {
    pub fn from_elf_machine(machine: u16) -> Result<Arch> {
        use goblin::elf::header::{EM_386, EM_ARM, EM_X86_64};
        match machine {
            EM_386 => Ok(Arch::I386),
            EM_X86_64 => Ok(Arch::X86_64),
            EM_ARM => Ok(Arch::Arm),
            other => Err(GuestError::UnsupportedArch(other)),
        }
    }

    pub fn is_32bit(self) -> bool {
        match self {
            Arch::I386 | Arch::Arm => true,
            Arch::X86_64 => false,
        }
    }

    /// Length of the syscall instruction encoding.
    pub fn syscall_insn_len(self) -> u64 {
        match self {
            Arch::I386 | Arch::X86_64 => 2,
            Arch::Arm => 4,
        }
    }

    /// How far the program counter overshoots a breakpoint trap. The ARM
    /// undefined-instruction trap reports the faulting word itself.
    pub fn breakpoint_rewind(self) -> u64 {
        match self {
            Arch::I386 | Arch::X86_64 => 1,
            Arch::Arm => 0,
        }
    }
}

pub mod x64 {
    /// General registers, kernel field order (struct user_regs_struct,
    /// arch/x86/include/asm/user_64.h).
    #[repr(C)]
    #[derive(Copy, Clone, Default, Debug, PartialEq)]
    pub struct user_regs_struct {
        pub r15: u64,
        pub r14: u64,
        pub r13: u64,
        pub r12: u64,
        pub rbp: u64,
        pub rbx: u64,
        pub r11: u64,
        pub r10: u64,
        pub r9: u64,
        pub r8: u64,
        pub rax: u64,
        pub rcx: u64,
        pub rdx: u64,
        pub rsi: u64,
        pub rdi: u64,
        pub orig_rax: u64,
        pub rip: u64,
        pub cs: u64,
        pub eflags: u64,
        pub rsp: u64,
        pub ss: u64,
        pub fs_base: u64,
        pub gs_base: u64,
        pub ds: u64,
        pub es: u64,
        pub fs: u64,
        pub gs: u64,
    }

    /// The fxsave block PTRACE_GETFPREGS fills.
    #[repr(C)]
    #[derive(Copy, Clone)]
    pub struct user_fpregs_struct {
        pub cwd: u16,
        pub swd: u16,
        pub ftw: u16,
        pub fop: u16,
        pub rip: u64,
        pub rdp: u64,
        pub mxcsr: u32,
        pub mxcr_mask: u32,
        pub st_space: [u32; 32],
        pub xmm_space: [u32; 64],
        pub padding: [u32; 24],
    }

    impl Default for user_fpregs_struct {
        fn default() -> Self {
            unsafe { std::mem::zeroed() }
        }
    }
}

pub mod x86 {
    /// General registers, kernel field order (struct user_regs_struct,
    /// arch/x86/include/asm/user_32.h).
    #[repr(C)]
    #[derive(Copy, Clone, Default, Debug, PartialEq)]
    pub struct user_regs_struct {
        pub ebx: i32,
        pub ecx: i32,
        pub edx: i32,
        pub esi: i32,
        pub edi: i32,
        pub ebp: i32,
        pub eax: i32,
        pub xds: i32,
        pub xes: i32,
        pub xfs: i32,
        pub xgs: i32,
        pub orig_eax: i32,
        pub eip: i32,
        pub xcs: i32,
        pub eflags: i32,
        pub esp: i32,
        pub xss: i32,
    }
}

pub mod arm {
    /// r0-r15, cpsr, orig_r0 as PTRACE_GETREGS delivers them.
    #[repr(C)]
    #[derive(Copy, Clone, Default, Debug, PartialEq)]
    pub struct user_regs {
        pub uregs: [u32; 18],
    }
}

const_assert_eq!(std::mem::size_of::<x64::user_regs_struct>(), 216);
const_assert_eq!(std::mem::size_of::<x64::user_fpregs_struct>(), 512);
const_assert_eq!(std::mem::size_of::<x86::user_regs_struct>(), 68);
const_assert_eq!(std::mem::size_of::<arm::user_regs>(), 72);

// No signed extension
pub fn from_x86_narrow(r64: &mut u64, r32: i32) {
    *r64 = r32 as u32 as u64;
}

// Signed extension
pub fn from_x86_narrow_signed(r64: &mut u64, r32: i32) {
    *r64 = r32 as i64 as u64;
}

pub fn to_x86_narrow(r32: &mut i32, r64: u64) {
    *r32 = r64 as i32;
}

/// Widen an i386 register file into the native 64-bit layout the trace
/// primitive accepts. The accumulator widens signed so syscall results and
/// errnos survive.
pub fn widen_x86(x86: &x86::user_regs_struct) -> x64::user_regs_struct {
    let mut x64 = x64::user_regs_struct::default();
    widen_x86_into(x86, &mut x64);
    x64
}

/// Same widening into an existing native block, leaving fs_base/gs_base and
/// anything the i386 view does not carry untouched.
pub fn widen_x86_into(x86: &x86::user_regs_struct, x64: &mut x64::user_regs_struct) {
    from_x86_narrow_signed(&mut x64.rax, x86.eax);
    from_x86_narrow(&mut x64.rbx, x86.ebx);
    from_x86_narrow(&mut x64.rcx, x86.ecx);
    from_x86_narrow(&mut x64.rdx, x86.edx);
    from_x86_narrow(&mut x64.rsi, x86.esi);
    from_x86_narrow(&mut x64.rdi, x86.edi);
    from_x86_narrow(&mut x64.rsp, x86.esp);
    from_x86_narrow(&mut x64.rbp, x86.ebp);
    from_x86_narrow(&mut x64.rip, x86.eip);
    from_x86_narrow(&mut x64.orig_rax, x86.orig_eax);
    from_x86_narrow(&mut x64.eflags, x86.eflags);
    from_x86_narrow(&mut x64.cs, x86.xcs);
    from_x86_narrow(&mut x64.ds, x86.xds);
    from_x86_narrow(&mut x64.es, x86.xes);
    from_x86_narrow(&mut x64.fs, x86.xfs);
    from_x86_narrow(&mut x64.gs, x86.xgs);
    from_x86_narrow(&mut x64.ss, x86.xss);
}

/// Narrow a native 64-bit register file into the i386 view of an i386
/// tracee.
pub fn narrow_x64(x64: &x64::user_regs_struct) -> x86::user_regs_struct {
    let mut x86 = x86::user_regs_struct::default();
    to_x86_narrow(&mut x86.eax, x64.rax);
    to_x86_narrow(&mut x86.ebx, x64.rbx);
    to_x86_narrow(&mut x86.ecx, x64.rcx);
    to_x86_narrow(&mut x86.edx, x64.rdx);
    to_x86_narrow(&mut x86.esi, x64.rsi);
    to_x86_narrow(&mut x86.edi, x64.rdi);
    to_x86_narrow(&mut x86.esp, x64.rsp);
    to_x86_narrow(&mut x86.ebp, x64.rbp);
    to_x86_narrow(&mut x86.eip, x64.rip);
    to_x86_narrow(&mut x86.orig_eax, x64.orig_rax);
    to_x86_narrow(&mut x86.eflags, x64.eflags);
    to_x86_narrow(&mut x86.xcs, x64.cs);
    to_x86_narrow(&mut x86.xds, x64.ds);
    to_x86_narrow(&mut x86.xes, x64.es);
    to_x86_narrow(&mut x86.xfs, x64.fs);
    to_x86_narrow(&mut x86.xgs, x64.gs);
    to_x86_narrow(&mut x86.xss, x64.ss);
    x86
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widen_narrow_round_trip() {
        let mut r = x86::user_regs_struct::default();
        r.eax = -38; // -ENOSYS as a syscall-entry accumulator
        r.ebx = 0x1234;
        r.eip = 0x0804_8000u32 as i32;
        let wide = widen_x86(&r);
        assert_eq!(wide.rax, (-38i64) as u64);
        assert_eq!(wide.rbx, 0x1234);
        assert_eq!(wide.rip, 0x0804_8000);
        assert_eq!(narrow_x64(&wide), r);
    }

    #[test]
    fn arch_tags() {
        assert_eq!(Arch::from_elf_machine(62).unwrap(), Arch::X86_64);
        assert_eq!(Arch::from_elf_machine(3).unwrap(), Arch::I386);
        assert_eq!(Arch::from_elf_machine(40).unwrap(), Arch::Arm);
        assert!(Arch::from_elf_machine(8).is_err());
        assert!(Arch::I386.is_32bit());
        assert!(!Arch::X86_64.is_32bit());
        assert_eq!(Arch::Arm.syscall_insn_len(), 4);
        assert_eq!(Arch::X86_64.breakpoint_rewind(), 1);
        assert_eq!(Arch::Arm.breakpoint_rewind(), 0);
    }
}
