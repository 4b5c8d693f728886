//! Ties together all state information for the traced child: register
//! state, memory mappings, symbol indexes, and syscall param/result access.
//! This is basically an anemic operating-system process structure.

use crate::abi::GuestAbi;
use crate::cpu::{poke_word, CpuState};
use crate::elf_debug::ElfDebug;
use crate::errors::{GuestError, Result};
use crate::guest_ptr::GuestPtr;
use crate::kernel_abi::Arch;
use crate::mem::{GuestMem, Mapping};
use crate::symbols::Symbols;
use crate::syscall_params::SyscallParams;
use log::{debug, warn};
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

pub struct Guest {
    arch: Arch,
    /// Active thread.
    cpu_state: CpuState,
    /// Parked threads; does NOT contain the active state.
    thread_cpus: Vec<CpuState>,
    mem: Box<dyn GuestMem>,
    bin_path: PathBuf,
    abi: GuestAbi,
    entry_pt: GuestPtr,
    /// Displaced words per planted breakpoint.
    breakpoints: HashMap<GuestPtr, u64>,
    // lazy loaded
    symbols: Option<Symbols>,
    dyn_symbols: Option<Symbols>,
    argv_ptrs: Vec<GuestPtr>,
    argc_ptr: GuestPtr,
    /// Set while a traced child backs this Guest; snapshot loads have none.
    live_pid: Option<Pid>,
    /// Spawned children die with the Guest; attached ones are released.
    owns_child: bool,
}

impl Guest {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        arch: Arch,
        cpu_state: CpuState,
        thread_cpus: Vec<CpuState>,
        mem: Box<dyn GuestMem>,
        bin_path: PathBuf,
        entry_pt: GuestPtr,
        abi: GuestAbi,
        live_pid: Option<Pid>,
        owns_child: bool,
    ) -> Guest {
        Guest {
            arch,
            cpu_state,
            thread_cpus,
            mem,
            bin_path,
            abi,
            entry_pt,
            breakpoints: HashMap::new(),
            symbols: None,
            dyn_symbols: None,
            argv_ptrs: Vec::new(),
            argc_ptr: GuestPtr::null(),
            live_pid,
            owns_child,
        }
    }

    pub(crate) fn set_arg_ptrs(&mut self, argc_ptr: GuestPtr, argv_ptrs: Vec<GuestPtr>) {
        self.argc_ptr = argc_ptr;
        self.argv_ptrs = argv_ptrs;
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn entry_point(&self) -> GuestPtr {
        self.entry_pt
    }

    pub fn binary_path(&self) -> &Path {
        &self.bin_path
    }

    pub fn pid(&self) -> Option<Pid> {
        self.live_pid
    }

    pub fn abi(&self) -> &GuestAbi {
        &self.abi
    }

    pub fn mem(&self) -> &dyn GuestMem {
        self.mem.as_ref()
    }

    pub fn mem_mut(&mut self) -> &mut dyn GuestMem {
        self.mem.as_mut()
    }

    /// Swap out the memory layer, mainly to replace a trace-primitive view
    /// with an in-process one.
    pub fn set_mem(&mut self, mem: Box<dyn GuestMem>) {
        self.mem = mem;
    }

    pub fn memory_map(&self) -> Vec<Mapping> {
        self.mem.state().mappings().cloned().collect()
    }

    pub fn cpu_state(&self) -> &CpuState {
        &self.cpu_state
    }

    pub fn cpu_state_mut(&mut self) -> &mut CpuState {
        &mut self.cpu_state
    }

    pub fn num_threads(&self) -> usize {
        1 + self.thread_cpus.len()
    }

    pub fn thread_cpu(&self, i: usize) -> Option<&CpuState> {
        if i == 0 {
            Some(&self.cpu_state)
        } else {
            self.thread_cpus.get(i - 1)
        }
    }

    /// Make thread `i` the active CPU state; the previous active parks in
    /// its slot. Index 0 is the active thread itself.
    pub fn switch_thread(&mut self, i: usize) -> Result<()> {
        if i == 0 {
            return Ok(());
        }
        let parked = self
            .thread_cpus
            .get_mut(i - 1)
            .ok_or(GuestError::Unsupported("no such thread"))?;
        std::mem::swap(&mut self.cpu_state, parked);
        Ok(())
    }

    pub fn syscall_params(&self) -> SyscallParams {
        self.abi.syscall_params(&self.cpu_state)
    }

    pub fn set_syscall_result(&mut self, ret: u64) {
        self.abi.set_syscall_result(&mut self.cpu_state, ret)
    }

    /// The exit-code register of the active thread, 32-bit-masked for
    /// 32-bit guests.
    pub fn exit_code(&self) -> u64 {
        self.abi.exit_code(&self.cpu_state)
    }

    pub fn argv_ptrs(&self) -> &[GuestPtr] {
        &self.argv_ptrs
    }

    pub fn argc_ptr(&self) -> GuestPtr {
        self.argc_ptr
    }

    // breakpoints

    /// Plant a trap at `addr`, remembering the displaced word.
    pub fn set_breakpoint(&mut self, addr: GuestPtr) -> Result<()> {
        let displaced = self.cpu_state.set_breakpoint(addr)?;
        self.breakpoints.insert(addr, displaced);
        Ok(())
    }

    /// Put the original word back at `addr`.
    pub fn reset_breakpoint(&mut self, addr: GuestPtr) -> Result<()> {
        let displaced = self
            .breakpoints
            .remove(&addr)
            .ok_or(GuestError::Unsupported("no breakpoint at address"))?;
        let pid = self.cpu_state.pid();
        poke_word(pid, addr, displaced)?;
        self.cpu_state.clear_undo(addr);
        Ok(())
    }

    /// After a trap stop: restore bytes and rewind the program counter.
    /// Returns the breakpoint address, or null if none was pending.
    pub fn undo_breakpoint(&mut self) -> Result<GuestPtr> {
        let addr = self.cpu_state.undo_breakpoint()?;
        if !addr.is_null() {
            self.breakpoints.remove(&addr);
        }
        Ok(addr)
    }

    // symbols

    /// Walk every ELF-backed mapping and index its code symbols. Memoized;
    /// `reload_symbols` drops the cache after mapping mutations.
    pub fn symbols(&mut self) -> &Symbols {
        if self.symbols.is_none() {
            let loaded = self.load_symbols();
            self.symbols = Some(loaded);
        }
        self.symbols.as_ref().unwrap()
    }

    /// Dynamic-linker stubs of the binary, resolved through guest memory.
    pub fn dyn_symbols(&mut self) -> &Symbols {
        if self.dyn_symbols.is_none() {
            let loaded = match ElfDebug::get_linkage_syms(self.mem.as_ref(), &self.bin_path) {
                Ok(s) => s,
                Err(e) => {
                    debug!("no linkage symbols from {:?}: {}", self.bin_path, e);
                    Symbols::new()
                }
            };
            self.dyn_symbols = Some(loaded);
        }
        self.dyn_symbols.as_ref().unwrap()
    }

    pub fn reload_symbols(&mut self) {
        self.symbols = None;
        self.dyn_symbols = None;
    }

    pub(crate) fn loaded_symbols(&self) -> Option<&Symbols> {
        self.symbols.as_ref()
    }

    pub(crate) fn loaded_dyn_symbols(&self) -> Option<&Symbols> {
        self.dyn_symbols.as_ref()
    }

    pub(crate) fn install_symbols(&mut self, syms: Option<Symbols>, dyn_syms: Option<Symbols>) {
        self.symbols = syms;
        self.dyn_symbols = dyn_syms;
    }

    fn load_symbols(&self) -> Symbols {
        let mut all = Symbols::new();
        // lowest mapped base per image is its load base
        let mut files: BTreeMap<String, GuestPtr> = BTreeMap::new();
        for m in self.mem.state().mappings() {
            if !m.is_file_backed() {
                continue;
            }
            let name = m.name.clone().unwrap();
            let base = files.entry(name).or_insert(m.base);
            if m.base < *base {
                *base = m.base;
            }
        }
        for (name, base) in files {
            match ElfDebug::get_syms(Path::new(&name), base) {
                Ok(syms) => all.add_syms(&syms),
                Err(e) => debug!("no symbols from {}: {}", name, e),
            }
        }
        all
    }

    /// Merge one library's symbols, relocated by `base`, into the index.
    pub fn add_library_syms(&mut self, path: &Path, base: GuestPtr) -> Result<()> {
        let syms = ElfDebug::get_syms(path, base)?;
        let _ = self.symbols(); // the memoized load has to happen first
        self.symbols.as_mut().unwrap().add_syms(&syms);
        Ok(())
    }

    /// Human name for a guest address: containing symbol plus offset, hex
    /// otherwise.
    pub fn name_of(&mut self, p: GuestPtr) -> String {
        if let Some(sym) = self.symbols().find_by_addr(p) {
            let off = p.offset_from(sym.base());
            return if off == 0 {
                sym.name().to_owned()
            } else {
                format!("{}+{:#x}", sym.name(), off)
            };
        }
        format!("{}", p)
    }

    // save/load façade; the legwork lives in the snapshot module

    pub fn save(&self, dir: &Path) -> Result<()> {
        crate::snapshot::save(self, dir)
    }

    pub fn load(dir: &Path) -> Result<Guest> {
        crate::snapshot::load(dir)
    }

    pub fn to_core(&self, path: &Path) -> Result<()> {
        crate::core_dump::to_core(self, path)
    }
}

impl Drop for Guest {
    fn drop(&mut self) {
        let pid = match self.live_pid {
            Some(p) => p,
            None => return,
        };
        // put displaced words back before letting the child go
        for (addr, displaced) in self.breakpoints.drain() {
            if let Err(e) = poke_word(pid, addr, displaced) {
                warn!("failed to restore breakpoint at {}: {}", addr, e);
            }
        }
        for t in &self.thread_cpus {
            let _ = ptrace::detach(t.pid(), None);
        }
        if self.owns_child {
            let _ = kill(pid, Signal::SIGKILL);
            let _ = ptrace::detach(pid, None);
        } else {
            let _ = ptrace::detach(pid, None);
        }
    }
}
