//! ELF symbol extraction: walks an image's symbol, dynamic-symbol and
//! PLT-relocation tables into `Symbol` streams. Parsing is goblin's;
//! selection and relocation policy is ours.

use crate::errors::Result;
use crate::guest_ptr::GuestPtr;
use crate::kernel_abi::Arch;
use crate::mem::GuestMem;
use crate::symbols::{Symbol, Symbols};
use goblin::elf::header::ET_EXEC;
use goblin::elf::section_header::SHT_RELA;
use goblin::elf::sym::STT_FUNC;
use goblin::elf::Elf;
use log::debug;
use std::path::Path;

/// The relocation table is the RELA section whose sh_info is 12. The
/// proper selection would be "sh_info equals the section index of .plt";
/// this constant is what shipped binaries have matched against so far.
const PLT_RELA_SH_INFO: u32 = 12;

/// PLT trampoline geometry: how far behind the resolved slot pointer the
/// stub starts, and how long it is.
fn plt_stub_geometry(arch: Arch) -> (u64, u64) {
    match arch {
        Arch::X86_64 | Arch::I386 => (6, 6),
        Arch::Arm => (12, 12),
    }
}

struct LinkageEntry {
    name: String,
    slot: GuestPtr,
    is_code: bool,
}

struct RawSym {
    name: String,
    value: u64,
    size: u64,
    is_code: bool,
}

/// One parsed image, ready to stream symbols. Construct from a path or an
/// already-read byte image.
pub struct ElfDebug {
    arch: Arch,
    is_exec: bool,
    entry: GuestPtr,
    /// True when the non-dynamic symtab supplied `syms` (and relocation by
    /// load base applies for non-executables).
    has_symtab: bool,
    syms: Vec<RawSym>,
    linkage: Vec<LinkageEntry>,
    next_sym_idx: usize,
    next_rela_idx: usize,
}

/// Versioned-symbol names carry an "@@" sigil; everything from it on is the
/// version, not the name.
fn trim_version(name: &str) -> &str {
    match name.find("@@") {
        Some(i) => &name[..i],
        None => name,
    }
}

impl ElfDebug {
    pub fn from_path(path: &Path) -> Result<ElfDebug> {
        let data = std::fs::read(path)?;
        ElfDebug::from_bytes(&data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<ElfDebug> {
        let elf = Elf::parse(data)?;
        let arch = Arch::from_elf_machine(elf.header.e_machine)?;
        let is_exec = elf.header.e_type == ET_EXEC;

        let has_symtab = elf.syms.len() > 0;
        let mut syms = Vec::new();
        if has_symtab {
            for sym in elf.syms.iter() {
                let name = match elf.strtab.get(sym.st_name).and_then(|r| r.ok()) {
                    Some(n) => n,
                    None => continue,
                };
                syms.push(RawSym {
                    name: trim_version(name).to_owned(),
                    value: sym.st_value,
                    size: sym.st_size,
                    is_code: sym.st_type() == STT_FUNC,
                });
            }
        } else {
            for sym in elf.dynsyms.iter() {
                let name = match elf.dynstrtab.get(sym.st_name).and_then(|r| r.ok()) {
                    Some(n) => n,
                    None => continue,
                };
                syms.push(RawSym {
                    name: trim_version(name).to_owned(),
                    value: sym.st_value,
                    size: sym.st_size,
                    is_code: sym.st_type() == STT_FUNC,
                });
            }
        }

        // The PLT relocation walk needs the matching section header; goblin
        // already parsed every SHT_RELA section for us.
        let mut linkage = Vec::new();
        for (idx, shdr) in elf.section_headers.iter().enumerate() {
            if shdr.sh_type != SHT_RELA || shdr.sh_info != PLT_RELA_SH_INFO {
                continue;
            }
            if let Some((_, relocs)) = elf.shdr_relocs.iter().find(|(i, _)| *i == idx) {
                for reloc in relocs.iter() {
                    let sym = match elf.dynsyms.get(reloc.r_sym) {
                        Some(s) => s,
                        None => continue,
                    };
                    let name = match elf.dynstrtab.get(sym.st_name).and_then(|r| r.ok()) {
                        Some(n) => n,
                        None => continue,
                    };
                    linkage.push(LinkageEntry {
                        name: trim_version(name).to_owned(),
                        slot: GuestPtr(reloc.r_offset),
                        is_code: sym.st_type() == STT_FUNC,
                    });
                }
            }
            break;
        }

        Ok(ElfDebug {
            arch,
            is_exec,
            entry: GuestPtr(elf.entry),
            has_symtab,
            syms,
            linkage,
            next_sym_idx: 0,
            next_rela_idx: 0,
        })
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn is_exec(&self) -> bool {
        self.is_exec
    }

    pub fn entry(&self) -> GuestPtr {
        self.entry
    }

    /// Next symbol with a non-null value and a non-empty name; addresses are
    /// as recorded in the image, not relocated.
    pub fn next_sym(&mut self) -> Option<Symbol> {
        while self.next_sym_idx < self.syms.len() {
            let raw = &self.syms[self.next_sym_idx];
            self.next_sym_idx += 1;
            if raw.value == 0 || raw.name.is_empty() {
                continue;
            }
            return Some(Symbol::new(
                raw.name.clone(),
                GuestPtr(raw.value),
                raw.size,
                !self.has_symtab,
                raw.is_code,
            ));
        }
        None
    }

    /// Next dynamic-linkage stub: the relocation slot is dereferenced
    /// through the guest's memory, and the trampoline is reported behind the
    /// resolved pointer. Unreadable slots are skipped.
    pub fn next_linkage_sym(&mut self, mem: &dyn GuestMem) -> Option<Symbol> {
        let (back, len) = plt_stub_geometry(self.arch);
        while self.next_rela_idx < self.linkage.len() {
            let ent = &self.linkage[self.next_rela_idx];
            self.next_rela_idx += 1;
            let resolved = match mem.read64(ent.slot) {
                Ok(v) => v,
                Err(e) => {
                    debug!("linkage slot {} unreadable: {}", ent.slot, e);
                    continue;
                }
            };
            return Some(Symbol::new(
                ent.name.clone(),
                GuestPtr(resolved) - back,
                len,
                false,
                ent.is_code,
            ));
        }
        None
    }

    /// Code symbols of the image as an index, relocated by `base` when the
    /// non-dynamic table of a non-executable supplied them.
    pub fn get_syms(path: &Path, base: GuestPtr) -> Result<Symbols> {
        let mut ed = ElfDebug::from_path(path)?;
        let relocate = ed.has_symtab && !ed.is_exec;
        let mut out = Symbols::new();
        while let Some(sym) = ed.next_sym() {
            if !sym.is_code() {
                continue;
            }
            let addr = if relocate {
                sym.base() + base.as_u64()
            } else {
                sym.base()
            };
            out.add_sym(Symbol::new(
                sym.name().to_owned(),
                addr,
                sym.length(),
                sym.is_dynamic(),
                true,
            ));
        }
        Ok(out)
    }

    /// Dynamic-linker stubs discovered post-relocation through `mem`.
    pub fn get_linkage_syms(mem: &dyn GuestMem, path: &Path) -> Result<Symbols> {
        let mut ed = ElfDebug::from_path(path)?;
        let mut out = Symbols::new();
        while let Some(sym) = ed.next_linkage_sym(mem) {
            out.add_sym(sym);
        }
        Ok(out)
    }

    pub fn arch_of_path(path: &Path) -> Result<Arch> {
        Ok(ElfDebug::from_path(path)?.arch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::GuestError;
    use crate::mem::{GuestMem, Mapping, SnapshotMem};
    use nix::sys::mman::ProtFlags;

    struct Builder(Vec<u8>);

    impl Builder {
        fn new() -> Builder {
            Builder(Vec::new())
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
        fn pad_to(&mut self, len: usize) {
            while self.0.len() < len {
                self.0.push(0);
            }
        }
    }

    fn shdr(b: &mut Builder, name: u32, typ: u32, off: u64, size: u64, link: u32, entsize: u64) {
        b.u32(name);
        b.u32(typ);
        b.u64(0); // flags
        b.u64(0); // addr
        b.u64(off);
        b.u64(size);
        b.u32(link);
        b.u32(0); // info
        b.u64(0); // align
        b.u64(entsize);
    }

    fn sym64(b: &mut Builder, name: u32, info: u8, value: u64, size: u64) {
        b.u32(name);
        b.u8(info);
        b.u8(0);
        b.u16(1); // shndx, arbitrary non-UNDEF
        b.u64(value);
        b.u64(size);
    }

    /// A minimal ET_DYN image with a symtab holding a versioned function and
    /// a data object.
    fn tiny_elf(e_type: u16) -> Vec<u8> {
        let shstrtab = b"\0.shstrtab\0.symtab\0.strtab\0";
        let strtab = b"\0foo@@GLIBC_2.2.5\0bar\0";
        let shstr_off = 64u64;
        let str_off = shstr_off + shstrtab.len() as u64;
        let sym_off = str_off + strtab.len() as u64;
        let sym_size = 3 * 24u64;
        let sh_off = sym_off + sym_size;

        let mut b = Builder::new();
        // ehdr
        b.bytes(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        b.bytes(&[0; 8]);
        b.u16(e_type);
        b.u16(62); // EM_X86_64
        b.u32(1);
        b.u64(0x1000); // entry
        b.u64(0); // phoff
        b.u64(sh_off);
        b.u32(0); // flags
        b.u16(64); // ehsize
        b.u16(56); // phentsize
        b.u16(0); // phnum
        b.u16(64); // shentsize
        b.u16(4); // shnum
        b.u16(1); // shstrndx

        b.bytes(shstrtab);
        b.bytes(strtab);
        // symtab: null, foo (STT_FUNC), bar (STT_OBJECT)
        b.bytes(&[0; 24]);
        sym64(&mut b, 1, 0x12, 0x1230, 0x10);
        sym64(&mut b, 18, 0x11, 0x2000, 8);

        b.pad_to(sh_off as usize);
        // section headers: null, .shstrtab, .symtab (link -> 3), .strtab
        shdr(&mut b, 0, 0, 0, 0, 0, 0);
        shdr(&mut b, 1, 3, shstr_off, shstrtab.len() as u64, 0, 0);
        shdr(&mut b, 11, 2, sym_off, sym_size, 3, 24);
        shdr(&mut b, 19, 3, str_off, strtab.len() as u64, 0, 0);
        b.0
    }

    #[test]
    fn symbols_trim_and_flag() {
        let img = tiny_elf(3); // ET_DYN
        let mut ed = ElfDebug::from_bytes(&img).unwrap();
        assert_eq!(ed.arch(), Arch::X86_64);
        assert!(!ed.is_exec());
        assert_eq!(ed.entry(), GuestPtr(0x1000));

        let foo = ed.next_sym().unwrap();
        assert_eq!(foo.name(), "foo");
        assert_eq!(foo.base(), GuestPtr(0x1230));
        assert_eq!(foo.length(), 0x10);
        assert!(foo.is_code());

        let bar = ed.next_sym().unwrap();
        assert_eq!(bar.name(), "bar");
        assert!(!bar.is_code());
        assert!(ed.next_sym().is_none());
    }

    #[test]
    fn get_syms_relocates_non_executables() {
        let dir = std::env::temp_dir().join(format!("guestlib-elf-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let so = dir.join("tiny.so");
        std::fs::write(&so, tiny_elf(3)).unwrap();
        let syms = ElfDebug::get_syms(&so, GuestPtr(0x7fff_0000_0000)).unwrap();
        assert_eq!(
            syms.find_by_name("foo").unwrap().base(),
            GuestPtr(0x7fff_0000_1230)
        );
        // data symbols are not indexed
        assert!(syms.find_by_name("bar").is_none());

        let exe = dir.join("tiny.exe");
        std::fs::write(&exe, tiny_elf(2)).unwrap(); // ET_EXEC
        let syms = ElfDebug::get_syms(&exe, GuestPtr(0x7fff_0000_0000)).unwrap();
        assert_eq!(syms.find_by_name("foo").unwrap().base(), GuestPtr(0x1230));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn garbage_is_malformed_and_foreign_machines_reject() {
        match ElfDebug::from_bytes(b"not an elf at all") {
            Err(GuestError::ElfMalformed(_)) => {}
            other => panic!("expected ElfMalformed, got {:?}", other.map(|_| ())),
        }

        let mut img = tiny_elf(3);
        img[18] = 8; // EM_MIPS
        match ElfDebug::from_bytes(&img) {
            Err(GuestError::UnsupportedArch(8)) => {}
            other => panic!("expected UnsupportedArch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn linkage_walk_uses_guest_memory() {
        // no sh_info==12 RELA section: the walk yields nothing
        let img = tiny_elf(3);
        let mut ed = ElfDebug::from_bytes(&img).unwrap();
        let mut mem = SnapshotMem::new();
        mem.state_mut().record_mapping(Mapping::anon(
            GuestPtr(0x1000),
            0x1000,
            ProtFlags::PROT_READ,
        ));
        assert!(ed.next_linkage_sym(&mem).is_none());
    }
}
