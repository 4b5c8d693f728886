//! Emits an ELF core file in the guest's own layout, loadable by the guest
//! platform's debugger: a PT_LOAD per mapping mirroring the Guest's memory
//! map, and an NT_PRSTATUS note per thread carrying the raw register
//! buffer.

use crate::cpu::CpuState;
use crate::errors::Result;
use crate::guest::Guest;
use crate::kernel_abi::Arch;
use crate::mem::Mapping;
use log::debug;
use nix::sys::mman::ProtFlags;
use std::fs;
use std::path::Path;

const ET_CORE: u16 = 4;
const PT_LOAD: u32 = 1;
const PT_NOTE: u32 = 4;
const NT_PRSTATUS: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

struct Pack(Vec<u8>);

impl Pack {
    fn new() -> Pack {
        Pack(Vec::new())
    }
    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }
    fn u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn bytes(&mut self, v: &[u8]) {
        self.0.extend_from_slice(v);
    }
    fn align(&mut self, to: usize) {
        while self.0.len() % to != 0 {
            self.0.push(0);
        }
    }
    fn len(&self) -> usize {
        self.0.len()
    }
}

/// elf_prstatus geometry per arch: (pr_pid offset, pr_reg offset, total
/// size). The register block between pr_reg and pr_fpvalid is exactly the
/// raw buffer the CPU state carries.
fn prstatus_geometry(arch: Arch) -> (usize, usize, usize) {
    match arch {
        Arch::X86_64 => (32, 112, 336),
        Arch::I386 => (24, 72, 144),
        Arch::Arm => (24, 72, 148),
    }
}

fn elf_machine(arch: Arch) -> u16 {
    match arch {
        Arch::X86_64 => 62,
        Arch::I386 => 3,
        Arch::Arm => 40,
    }
}

fn build_prstatus(arch: Arch, cpu: &CpuState) -> Vec<u8> {
    let (pid_off, reg_off, total) = prstatus_geometry(arch);
    let mut buf = vec![0u8; total];
    let pid = cpu.pid().as_raw();
    buf[pid_off..pid_off + 4].copy_from_slice(&pid.to_le_bytes());
    let regs = cpu.state_data();
    buf[reg_off..reg_off + regs.len()].copy_from_slice(regs);
    buf
}

fn phdr_flags(prot: ProtFlags) -> u32 {
    let mut f = 0;
    if prot.contains(ProtFlags::PROT_READ) {
        f |= PF_R;
    }
    if prot.contains(ProtFlags::PROT_WRITE) {
        f |= PF_W;
    }
    if prot.contains(ProtFlags::PROT_EXEC) {
        f |= PF_X;
    }
    f
}

fn write_note(note: &mut Pack, arch: Arch, cpu: &CpuState) {
    let prstatus = build_prstatus(arch, cpu);
    note.u32(5); // "CORE\0"
    note.u32(prstatus.len() as u32);
    note.u32(NT_PRSTATUS);
    note.bytes(b"CORE\0");
    note.align(4);
    note.bytes(&prstatus);
    note.align(4);
}

pub fn to_core(g: &Guest, path: &Path) -> Result<()> {
    let arch = g.arch();
    let mappings: Vec<Mapping> = g.memory_map();
    let is64 = !arch.is_32bit();
    let (ehsize, phentsize) = if is64 { (64usize, 56usize) } else { (52, 32) };
    let phnum = mappings.len() + 1;

    // active thread first, exactly as a dumping kernel orders them
    let mut note = Pack::new();
    for i in 0..g.num_threads() {
        write_note(&mut note, arch, g.thread_cpu(i).unwrap());
    }

    let note_off = ehsize + phnum * phentsize;
    let mut out = Pack::new();

    // ehdr
    out.bytes(&[0x7f, b'E', b'L', b'F']);
    out.u8(if is64 { 2 } else { 1 });
    out.u8(1); // little-endian
    out.u8(1); // version
    out.u8(0); // osabi
    out.bytes(&[0; 8]);
    out.u16(ET_CORE);
    out.u16(elf_machine(arch));
    out.u32(1);
    if is64 {
        out.u64(0); // entry
        out.u64(ehsize as u64); // phoff
        out.u64(0); // shoff
    } else {
        out.u32(0);
        out.u32(ehsize as u32);
        out.u32(0);
    }
    out.u32(0); // flags
    out.u16(ehsize as u16);
    out.u16(phentsize as u16);
    out.u16(phnum as u16);
    out.u16(0); // shentsize
    out.u16(0); // shnum
    out.u16(0); // shstrndx

    // program headers; data lands after the note
    let mut seg_off = (note_off + note.len()) as u64;
    if is64 {
        out.u32(PT_NOTE);
        out.u32(0);
        out.u64(note_off as u64);
        out.u64(0); // vaddr
        out.u64(0); // paddr
        out.u64(note.len() as u64);
        out.u64(0); // memsz
        out.u64(4);
    } else {
        out.u32(PT_NOTE);
        out.u32(note_off as u32);
        out.u32(0);
        out.u32(0);
        out.u32(note.len() as u32);
        out.u32(0);
        out.u32(0);
        out.u32(4);
    }
    for m in &mappings {
        if is64 {
            out.u32(PT_LOAD);
            out.u32(phdr_flags(m.prot));
            out.u64(seg_off);
            out.u64(m.base.as_u64());
            out.u64(0);
            out.u64(m.length as u64);
            out.u64(m.length as u64);
            out.u64(0x1000);
        } else {
            out.u32(PT_LOAD);
            out.u32(seg_off as u32);
            out.u32(m.base.as_u64() as u32);
            out.u32(0);
            out.u32(m.length as u32);
            out.u32(m.length as u32);
            out.u32(phdr_flags(m.prot));
            out.u32(0x1000);
        }
        seg_off += m.length as u64;
    }

    debug_assert_eq!(out.len(), note_off);
    out.bytes(&note.0);

    // segment contents; unreadable regions dump as zeros
    for m in &mappings {
        let mut buf = vec![0u8; m.length];
        if let Err(e) = g.mem().copy_from_guest(&mut buf, m.base) {
            debug!("core: mapping {} dumped as zeros: {}", m.base, e);
        }
        out.bytes(&buf);
    }

    fs::write(path, &out.0)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::GuestAbi;
    use crate::guest_ptr::GuestPtr;
    use crate::mem::{GuestMem, SnapshotMem};
    use crate::options::GuestOptions;
    use goblin::elf::Elf;
    use nix::unistd::Pid;
    use std::path::PathBuf;

    #[test]
    fn core_structure_parses_back() {
        let mut mem = SnapshotMem::new();
        mem.state_mut().record_mapping(Mapping::anon(
            GuestPtr(0x40_0000),
            0x1000,
            ProtFlags::PROT_READ | ProtFlags::PROT_EXEC,
        ));
        mem.state_mut().record_mapping(Mapping::anon(
            GuestPtr(0x60_0000),
            0x2000,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        ));
        mem.load_segment(GuestPtr(0x40_0000), vec![0x90u8; 0x1000]);
        mem.load_segment(GuestPtr(0x60_0000), vec![0u8; 0x2000]);

        let mut cpu = CpuState::new(Arch::X86_64, Pid::from_raw(1234));
        cpu.set_pc(GuestPtr(0x40_0100));
        let abi = GuestAbi::create(&cpu, &GuestOptions::default()).unwrap();
        let g = Guest::from_parts(
            Arch::X86_64,
            cpu,
            Vec::new(),
            Box::new(mem),
            PathBuf::from("/bin/true"),
            GuestPtr(0x40_0000),
            abi,
            None,
            false,
        );

        let path = std::env::temp_dir().join(format!("guestlib-core-{}", std::process::id()));
        g.to_core(&path).unwrap();

        let data = fs::read(&path).unwrap();
        let elf = Elf::parse(&data).unwrap();
        assert_eq!(elf.header.e_type, ET_CORE);
        assert_eq!(elf.header.e_machine, 62);
        assert_eq!(elf.program_headers.len(), 3);
        assert_eq!(elf.program_headers[0].p_type, PT_NOTE);
        assert_eq!(elf.program_headers[1].p_type, PT_LOAD);
        assert_eq!(elf.program_headers[1].p_vaddr, 0x40_0000);
        assert_eq!(elf.program_headers[2].p_filesz, 0x2000);

        // the text segment's bytes made it out
        let off = elf.program_headers[1].p_offset as usize;
        assert_eq!(data[off], 0x90);

        let _ = fs::remove_file(&path);
    }
}
