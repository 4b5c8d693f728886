//! Guest memory through the trace primitive: word-granular peeks and pokes
//! against the child, with mapping calls dispatched inside the child
//! itself.

use crate::cpu::{peek_word, poke_word, CpuState, WORD_SIZE};
use crate::errors::{GuestError, Result};
use crate::guest_ptr::GuestPtr;
use crate::kernel_abi::Arch;
use crate::kernel_metadata::{guest_syscall_nr, x64_nr};
use crate::mem::{page_ceil, GuestMem, Mapping, MemState};
use crate::syscall_params::SyscallParams;
use nix::sys::mman::{MapFlags, ProtFlags};
use nix::unistd::Pid;

pub struct PtraceMem {
    pid: Pid,
    /// Private scratch CPU for dispatching mapping syscalls in the child;
    /// dispatch saves and restores the child's registers around itself.
    cpu: CpuState,
    state: MemState,
}

impl PtraceMem {
    pub fn new(arch: Arch, pid: Pid) -> PtraceMem {
        PtraceMem {
            pid,
            cpu: CpuState::new(arch, pid),
            state: MemState::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Adopt a previously captured layout: base, bricks and every mapping,
    /// names included.
    pub fn import(&mut self, other: &MemState) {
        self.state.import(other);
    }

    fn dispatch(&mut self, canonical_nr: i64, args: [u64; 6]) -> Result<u64> {
        let nr = guest_syscall_nr(self.cpu.arch(), canonical_nr);
        let sp = SyscallParams::new(nr as u64, args);
        self.cpu.dispatch_syscall(&sp)
    }

    /// A dispatched mapping call answers in the kernel's convention:
    /// small-negative means errno.
    fn check_kernel_ret(&self, ret: u64) -> Result<u64> {
        let signed = if self.cpu.arch().is_32bit() {
            (ret as u32) as i32 as i64
        } else {
            ret as i64
        };
        if signed < 0 && signed > -4096 {
            Err(GuestError::Sys((-signed) as i32))
        } else {
            Ok(ret)
        }
    }
}

impl GuestMem for PtraceMem {
    fn state(&self) -> &MemState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut MemState {
        &mut self.state
    }

    fn read8(&self, p: GuestPtr) -> Result<u8> {
        let mask = (WORD_SIZE - 1) as u64;
        let word = peek_word(self.pid, GuestPtr(p.as_u64() & !mask))?;
        Ok((word >> (8 * (p.as_u64() & mask))) as u8)
    }

    fn read16(&self, p: GuestPtr) -> Result<u16> {
        if p.as_u64() % 2 != 0 {
            return Err(GuestError::MisalignedAccess(p));
        }
        Ok(peek_word(self.pid, p)? as u16)
    }

    fn read32(&self, p: GuestPtr) -> Result<u32> {
        if p.as_u64() % 4 != 0 {
            return Err(GuestError::MisalignedAccess(p));
        }
        Ok(peek_word(self.pid, p)? as u32)
    }

    fn read64(&self, p: GuestPtr) -> Result<u64> {
        if p.as_u64() % 8 != 0 {
            return Err(GuestError::MisalignedAccess(p));
        }
        if WORD_SIZE == 8 {
            peek_word(self.pid, p)
        } else {
            let lo = peek_word(self.pid, p)? as u32 as u64;
            let hi = peek_word(self.pid, p + 4u64)? as u32 as u64;
            Ok(lo | (hi << 32))
        }
    }

    fn write8(&mut self, p: GuestPtr, v: u8) -> Result<()> {
        let word = peek_word(self.pid, p)?;
        poke_word(self.pid, p, (word & !0xffu64) | v as u64)
    }

    fn write16(&mut self, p: GuestPtr, v: u16) -> Result<()> {
        let word = peek_word(self.pid, p)?;
        poke_word(self.pid, p, (word & !0xffffu64) | v as u64)
    }

    fn write32(&mut self, p: GuestPtr, v: u32) -> Result<()> {
        if WORD_SIZE == 4 {
            return poke_word(self.pid, p, v as u64);
        }
        let word = peek_word(self.pid, p)?;
        poke_word(self.pid, p, (word & !0xffff_ffffu64) | v as u64)
    }

    fn write64(&mut self, p: GuestPtr, v: u64) -> Result<()> {
        if WORD_SIZE == 8 {
            poke_word(self.pid, p, v)
        } else {
            poke_word(self.pid, p, v & 0xffff_ffff)?;
            poke_word(self.pid, p + 4u64, v >> 32)
        }
    }

    fn copy_to_guest(&mut self, dest: GuestPtr, src: &[u8]) -> Result<()> {
        let rem = src.len() % WORD_SIZE;
        for i in 0..rem {
            self.write8(dest + i, src[i])?;
        }
        if src.len() == rem {
            return Ok(());
        }
        self.cpu.copy_in(dest + rem, &src[rem..])
    }

    fn copy_from_guest(&self, dest: &mut [u8], src: GuestPtr) -> Result<()> {
        // fast path: aligned whole words
        if src.as_u64() % 8 == 0 && dest.len() % 8 == 0 {
            for i in 0..dest.len() / 8 {
                let w = self.read64(src + i * 8)?;
                dest[i * 8..i * 8 + 8].copy_from_slice(&w.to_le_bytes());
            }
            return Ok(());
        }
        for i in 0..dest.len() {
            dest[i] = self.read8(src + i)?;
        }
        Ok(())
    }

    fn memset(&mut self, dest: GuestPtr, val: u8, len: usize) -> Result<()> {
        for i in 0..len {
            self.write8(dest + i, val)?;
        }
        Ok(())
    }

    fn strlen(&self, p: GuestPtr) -> Result<usize> {
        let mut n = 0usize;
        while (p + n).as_u64() as usize % WORD_SIZE != 0 {
            if self.read8(p + n)? == 0 {
                return Ok(n);
            }
            n += 1;
        }
        loop {
            let word = peek_word(self.pid, p + n)?;
            let bytes = word.to_le_bytes();
            if let Some(i) = memchr::memchr(0, &bytes[..WORD_SIZE]) {
                return Ok(n + i);
            }
            n += WORD_SIZE;
        }
    }

    fn sbrk(&mut self, _new_top: GuestPtr) -> Result<()> {
        Err(GuestError::Unsupported("sbrk through the trace primitive"))
    }

    fn mmap(
        &mut self,
        addr: GuestPtr,
        length: usize,
        prot: ProtFlags,
        flags: MapFlags,
        fd: i32,
        offset: i64,
    ) -> Result<GuestPtr> {
        let ret = self.dispatch(
            x64_nr::MMAP,
            [
                addr.as_u64(),
                length as u64,
                prot.bits() as u64,
                flags.bits() as u64,
                fd as u64,
                offset as u64,
            ],
        )?;
        let base = GuestPtr(self.check_kernel_ret(ret)?);
        self.state.record_mapping(Mapping {
            base,
            length: page_ceil(length as u64) as usize,
            prot,
            flags,
            offset: offset as u64,
            name: None,
        });
        Ok(base)
    }

    fn mprotect(&mut self, addr: GuestPtr, length: usize, prot: ProtFlags) -> Result<()> {
        self.dispatch(
            x64_nr::MPROTECT,
            [addr.as_u64(), length as u64, prot.bits() as u64, 0, 0, 0],
        )?;
        self.state.protect_range(addr, length, prot);
        Ok(())
    }

    fn munmap(&mut self, addr: GuestPtr, length: usize) -> Result<()> {
        self.dispatch(x64_nr::MUNMAP, [addr.as_u64(), length as u64, 0, 0, 0, 0])?;
        self.state.remove_range(addr, length);
        Ok(())
    }

    fn mremap(
        &mut self,
        _old_addr: GuestPtr,
        _old_length: usize,
        _new_length: usize,
        _flags: i32,
    ) -> Result<GuestPtr> {
        Err(GuestError::Unsupported("mremap through the trace primitive"))
    }
}
