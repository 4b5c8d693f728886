//! Extracts syscall parameters from the raw register buffer and writes
//! results back, per an architecture descriptor of register names. Knows
//! nothing about struct-bearing syscalls; those live with the mediator and
//! its translators.

use crate::cpu::CpuState;
use crate::errors::{GuestError, Result};
use crate::kernel_abi::Arch;
use crate::options::GuestOptions;
use crate::syscall_params::SyscallParams;

const MAX_SC_REGS: usize = 7;

pub struct GuestAbi {
    /// Byte offsets of the registers carrying (nr, a0..a5), in order.
    sc_reg_off: [usize; MAX_SC_REGS],
    sc_reg_count: usize,
    scret_off: usize,
    exit_off: usize,
    is_32bit: bool,
    /// i386 entry convention; carried here so nothing consults a global.
    pub use_linux_sysenter: bool,
    /// Force the translation path even for a matching host arch.
    pub force_xlate: bool,
}

/// Register names per Linux ABI: the syscall-number register first, then
/// the six argument registers; the result register; the register holding
/// the exit code at exit/exit_group.
fn linux_descriptor(arch: Arch) -> Result<(&'static [&'static str], &'static str, &'static str)> {
    match arch {
        Arch::X86_64 => Ok((
            &["rax", "rdi", "rsi", "rdx", "r10", "r8", "r9"],
            "rax",
            "rdi",
        )),
        Arch::I386 => Ok((
            &["eax", "ebx", "ecx", "edx", "esi", "edi", "ebp"],
            "eax",
            "ebx",
        )),
        Arch::Arm => Ok((&["r7", "r0", "r1", "r2", "r3", "r4", "r5"], "r0", "r0")),
    }
}

/// Read up to eight bytes little-endian at `off`; short reads at the end of
/// the buffer zero-fill, the way the source reads a 64-bit slot out of a
/// 32-bit register file and masks.
fn read_slot(data: &[u8], off: usize) -> u64 {
    let end = std::cmp::min(off + 8, data.len());
    let mut b = [0u8; 8];
    b[..end - off].copy_from_slice(&data[off..end]);
    u64::from_le_bytes(b)
}

impl GuestAbi {
    pub fn create(cpu: &CpuState, opts: &GuestOptions) -> Result<GuestAbi> {
        let arch = cpu.arch();
        let (sc_regs, ret_reg, exit_reg) = linux_descriptor(arch)?;
        if sc_regs.len() > MAX_SC_REGS {
            return Err(GuestError::Unsupported("too many syscall registers"));
        }

        let mut sc_reg_off = [0usize; MAX_SC_REGS];
        for (i, name) in sc_regs.iter().enumerate() {
            sc_reg_off[i] = cpu.name_to_offset(name)?;
        }

        Ok(GuestAbi {
            sc_reg_off,
            sc_reg_count: sc_regs.len(),
            scret_off: cpu.name_to_offset(ret_reg)?,
            exit_off: cpu.name_to_offset(exit_reg)?,
            is_32bit: arch.is_32bit(),
            use_linux_sysenter: opts.use_linux_sysenter,
            force_xlate: opts.xlate_syscalls,
        })
    }

    pub fn is_32bit(&self) -> bool {
        self.is_32bit
    }

    pub fn syscall_params(&self, cpu: &CpuState) -> SyscallParams {
        let data = cpu.state_data();
        let mut v = [0u64; MAX_SC_REGS];
        for i in 0..self.sc_reg_count {
            v[i] = read_slot(data, self.sc_reg_off[i]);
            if self.is_32bit {
                v[i] &= 0xffff_ffff;
            }
        }
        SyscallParams::new(v[0], [v[1], v[2], v[3], v[4], v[5], v[6]])
    }

    pub fn syscall_result(&self, cpu: &CpuState) -> u64 {
        let v = read_slot(cpu.state_data(), self.scret_off);
        if self.is_32bit {
            v & 0xffff_ffff
        } else {
            v
        }
    }

    pub fn set_syscall_result(&self, cpu: &mut CpuState, ret: u64) {
        let off = self.scret_off;
        let data = cpu.state_data_mut();
        if self.is_32bit {
            data[off..off + 4].copy_from_slice(&(ret as u32).to_le_bytes());
        } else {
            data[off..off + 8].copy_from_slice(&ret.to_le_bytes());
        }
    }

    pub fn exit_code(&self, cpu: &CpuState) -> u64 {
        let v = read_slot(cpu.state_data(), self.exit_off);
        if self.is_32bit {
            v & 0xffff_ffff
        } else {
            v
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    fn write_reg(cpu: &mut CpuState, name: &str, width: usize, v: u64) {
        let off = cpu.name_to_offset(name).unwrap();
        let data = cpu.state_data_mut();
        data[off..off + width].copy_from_slice(&v.to_le_bytes()[..width]);
    }

    #[test]
    fn amd64_param_extraction() {
        let mut cpu = CpuState::new(Arch::X86_64, Pid::from_raw(1));
        let abi = GuestAbi::create(&cpu, &GuestOptions::default()).unwrap();

        write_reg(&mut cpu, "rax", 8, 231);
        write_reg(&mut cpu, "rdi", 8, 42);
        write_reg(&mut cpu, "rsi", 8, 0xdead_beef_0000);
        write_reg(&mut cpu, "r10", 8, 7);

        let sp = abi.syscall_params(&cpu);
        assert_eq!(sp.syscall(), 231);
        assert_eq!(sp.arg(0), 42);
        assert_eq!(sp.arg(1), 0xdead_beef_0000);
        assert_eq!(sp.arg(3), 7);
        assert_eq!(abi.exit_code(&cpu), 42);

        abi.set_syscall_result(&mut cpu, 0x1122_3344_5566_7788);
        assert_eq!(abi.syscall_result(&cpu), 0x1122_3344_5566_7788);
    }

    #[test]
    fn i386_masks_to_32_bits() {
        let mut cpu = CpuState::new(Arch::I386, Pid::from_raw(1));
        let abi = GuestAbi::create(&cpu, &GuestOptions::default()).unwrap();
        assert!(abi.is_32bit());

        write_reg(&mut cpu, "eax", 4, 252);
        write_reg(&mut cpu, "ebx", 4, 0xffff_ffff); // -1 in the guest
        let sp = abi.syscall_params(&cpu);
        assert_eq!(sp.syscall(), 252);
        // the adjacent register's bits never leak in
        assert_eq!(sp.arg(0), 0xffff_ffff);
        assert_eq!(abi.exit_code(&cpu), 0xffff_ffff);

        abi.set_syscall_result(&mut cpu, 0xaaaa_bbbb_cccc_dddd);
        assert_eq!(abi.syscall_result(&cpu), 0xcccc_dddd);
    }

    #[test]
    fn arm_descriptor_resolves() {
        let mut cpu = CpuState::new(Arch::Arm, Pid::from_raw(1));
        let abi = GuestAbi::create(&cpu, &GuestOptions::default()).unwrap();
        write_reg(&mut cpu, "r7", 4, 248);
        write_reg(&mut cpu, "r0", 4, 3);
        let sp = abi.syscall_params(&cpu);
        assert_eq!(sp.syscall(), 248);
        assert_eq!(sp.arg(0), 3);
        assert_eq!(abi.exit_code(&cpu), 3);
    }
}
