//! Snapshot legwork behind Guest::save/load: a serde manifest for layout
//! and identity, raw blobs for register buffers and memory segments. A
//! loaded Guest answers every accessor the way the saved one did; it just
//! has no live child behind it.

use crate::abi::GuestAbi;
use crate::cpu::CpuState;
use crate::errors::{GuestError, Result};
use crate::guest::Guest;
use crate::guest_ptr::GuestPtr;
use crate::kernel_abi::Arch;
use crate::mem::{GuestMem, Mapping, MemState, SnapshotMem};
use crate::options::GuestOptions;
use crate::symbols::{Symbol, Symbols};
use log::debug;
use nix::sys::mman::{MapFlags, ProtFlags};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize)]
struct MappingRecord {
    base: u64,
    length: usize,
    prot: i32,
    flags: i32,
    offset: u64,
    name: Option<String>,
    /// Segment blob under the snapshot dir, when the contents were
    /// readable at save time.
    file: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct Manifest {
    arch: Arch,
    bin_path: PathBuf,
    entry_pt: u64,
    base: u64,
    top_brick: u64,
    base_brick: u64,
    reserve_brick: u64,
    force_flat: bool,
    num_threads: usize,
    mappings: Vec<MappingRecord>,
}

fn regs_file(dir: &Path, i: usize) -> PathBuf {
    dir.join(format!("regs-{}.bin", i))
}

fn fpregs_file(dir: &Path, i: usize) -> PathBuf {
    dir.join(format!("fpregs-{}.bin", i))
}

fn seg_file_name(idx: usize) -> String {
    format!("maps/{:04}.bin", idx)
}

pub fn save(g: &Guest, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir.join("maps"))?;

    let st = g.mem().state();
    let mut records = Vec::new();
    for (idx, m) in st.mappings().enumerate() {
        let mut buf = vec![0u8; m.length];
        let file = match g.mem().copy_from_guest(&mut buf, m.base) {
            Ok(()) => {
                let name = seg_file_name(idx);
                fs::write(dir.join(&name), &buf)?;
                Some(name)
            }
            Err(e) => {
                debug!("mapping {} not saved: {}", m.base, e);
                None
            }
        };
        records.push(MappingRecord {
            base: m.base.as_u64(),
            length: m.length,
            prot: m.prot.bits(),
            flags: m.flags.bits(),
            offset: m.offset,
            name: m.name.clone(),
            file,
        });
    }

    let manifest = Manifest {
        arch: g.arch(),
        bin_path: g.binary_path().to_path_buf(),
        entry_pt: g.entry_point().as_u64(),
        base: st.base.as_u64(),
        top_brick: st.top_brick.as_u64(),
        base_brick: st.base_brick.as_u64(),
        reserve_brick: st.reserve_brick.as_u64(),
        force_flat: st.force_flat,
        num_threads: g.num_threads(),
        mappings: records,
    };
    let json = serde_json::to_string_pretty(&manifest)
        .map_err(|e| GuestError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    fs::write(dir.join("manifest.json"), json)?;

    for i in 0..g.num_threads() {
        let cpu = g.thread_cpu(i).unwrap();
        fs::write(regs_file(dir, i), cpu.state_data())?;
        if let Some(fp) = cpu.fp_data() {
            fs::write(fpregs_file(dir, i), fp)?;
        }
    }

    save_symbols(dir.join("symbols.json"), g.loaded_symbols())?;
    save_symbols(dir.join("dyn_symbols.json"), g.loaded_dyn_symbols())?;
    Ok(())
}

fn save_symbols(path: PathBuf, syms: Option<&Symbols>) -> Result<()> {
    if let Some(syms) = syms {
        let list: Vec<&Symbol> = syms.iter().collect();
        let json = serde_json::to_string(&list)
            .map_err(|e| GuestError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        fs::write(path, json)?;
    }
    Ok(())
}

fn load_symbols(path: PathBuf) -> Result<Option<Symbols>> {
    if !path.exists() {
        return Ok(None);
    }
    let json = fs::read_to_string(path)?;
    let list: Vec<Symbol> = serde_json::from_str(&json)
        .map_err(|e| GuestError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    let mut syms = Symbols::new();
    for s in list {
        syms.add_sym(s);
    }
    Ok(Some(syms))
}

pub fn load(dir: &Path) -> Result<Guest> {
    let json = fs::read_to_string(dir.join("manifest.json"))?;
    let manifest: Manifest = serde_json::from_str(&json)
        .map_err(|e| GuestError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

    let mut state = MemState::new();
    state.base = GuestPtr(manifest.base);
    state.top_brick = GuestPtr(manifest.top_brick);
    state.base_brick = GuestPtr(manifest.base_brick);
    state.reserve_brick = GuestPtr(manifest.reserve_brick);
    state.force_flat = manifest.force_flat;
    for r in &manifest.mappings {
        state.record_mapping(Mapping {
            base: GuestPtr(r.base),
            length: r.length,
            prot: ProtFlags::from_bits_truncate(r.prot),
            flags: MapFlags::from_bits_truncate(r.flags),
            offset: r.offset,
            name: r.name.clone(),
        });
    }

    let mut mem = SnapshotMem::from_state(state);
    for r in &manifest.mappings {
        if let Some(file) = &r.file {
            let mut data = fs::read(dir.join(file))?;
            data.resize(r.length, 0);
            mem.load_segment(GuestPtr(r.base), data);
        }
    }

    if manifest.num_threads == 0 {
        return Err(GuestError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "snapshot carries no threads",
        )));
    }
    let mut cpus = Vec::with_capacity(manifest.num_threads);
    for i in 0..manifest.num_threads {
        let mut cpu = CpuState::new(manifest.arch, Pid::from_raw(0));
        let blob = fs::read(regs_file(dir, i))?;
        let data = cpu.state_data_mut();
        if blob.len() != data.len() {
            return Err(GuestError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "register blob size mismatch",
            )));
        }
        data.copy_from_slice(&blob);
        let fp_path = fpregs_file(dir, i);
        if fp_path.exists() {
            let blob = fs::read(fp_path)?;
            if let Some(fp) = cpu.fp_data_mut() {
                if blob.len() == fp.len() {
                    fp.copy_from_slice(&blob);
                }
            }
        }
        cpus.push(cpu);
    }

    let active = cpus.remove(0);
    let abi = GuestAbi::create(&active, &GuestOptions::default())?;
    let mut guest = Guest::from_parts(
        manifest.arch,
        active,
        cpus,
        Box::new(mem),
        manifest.bin_path,
        GuestPtr(manifest.entry_pt),
        abi,
        None,
        false,
    );
    guest.install_symbols(
        load_symbols(dir.join("symbols.json"))?,
        load_symbols(dir.join("dyn_symbols.json"))?,
    );
    Ok(guest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall_params::SyscallParams;

    fn rw() -> ProtFlags {
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
    }

    #[test]
    fn round_trip_preserves_every_accessor() {
        let dir = std::env::temp_dir().join(format!("guestlib-snap-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);

        // build a guest worth saving
        let mut mem = SnapshotMem::new();
        let mut m = Mapping::anon(GuestPtr(0x10_0000), 0x2000, rw());
        m.name = Some("[heap]".to_owned());
        mem.state_mut().record_mapping(m);
        mem.load_segment(GuestPtr(0x10_0000), vec![0u8; 0x2000]);
        mem.state_mut().base_brick = GuestPtr(0x10_0000);
        mem.state_mut().top_brick = GuestPtr(0x10_2000);
        mem.copy_to_guest(GuestPtr(0x10_0100), b"snapshot payload")
            .unwrap();

        let mut cpu = CpuState::new(Arch::X86_64, Pid::from_raw(0));
        cpu.set_pc(GuestPtr(0x40_1234));
        cpu.set_stack_ptr(GuestPtr(0x7fff_0000));
        let abi = GuestAbi::create(&cpu, &GuestOptions::default()).unwrap();

        let mut g = Guest::from_parts(
            Arch::X86_64,
            cpu,
            vec![CpuState::new(Arch::X86_64, Pid::from_raw(0))],
            Box::new(mem),
            PathBuf::from("/bin/true"),
            GuestPtr(0x40_1000),
            abi,
            None,
            false,
        );
        let mut syms = Symbols::new();
        syms.add_sym(Symbol::new(
            "main".to_owned(),
            GuestPtr(0x40_1000),
            0x40,
            false,
            true,
        ));
        g.install_symbols(Some(syms), None);

        g.save(&dir).unwrap();
        let mut loaded = Guest::load(&dir).unwrap();

        assert_eq!(loaded.arch(), Arch::X86_64);
        assert_eq!(loaded.binary_path(), Path::new("/bin/true"));
        assert_eq!(loaded.entry_point(), GuestPtr(0x40_1000));
        assert_eq!(loaded.num_threads(), 2);
        assert_eq!(loaded.cpu_state().pc(), GuestPtr(0x40_1234));
        assert_eq!(loaded.cpu_state().stack_ptr(), GuestPtr(0x7fff_0000));
        assert_eq!(loaded.mem().brk(), GuestPtr(0x10_2000));

        let mut buf = [0u8; 16];
        loaded
            .mem()
            .copy_from_guest(&mut buf, GuestPtr(0x10_0100))
            .unwrap();
        assert_eq!(&buf, b"snapshot payload");

        assert_eq!(
            loaded.symbols().find_by_name("main").unwrap().base(),
            GuestPtr(0x40_1000)
        );
        assert_eq!(loaded.name_of(GuestPtr(0x40_1010)), "main+0x10");

        // register identity is visible through the ABI too
        let sp: SyscallParams = loaded.syscall_params();
        assert_eq!(sp.nr, 0); // rax was never staged

        let _ = fs::remove_dir_all(&dir);
    }
}
