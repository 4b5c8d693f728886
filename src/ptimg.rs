//! The process-capture driver: spawns or attaches to a child, drives it to
//! its first user instruction (or to a chosen syscall), and slurps its
//! registers, mappings and sibling threads into a Guest.

use crate::abi::GuestAbi;
use crate::cpu::{wait_stop, CpuState};
use crate::elf_debug::ElfDebug;
use crate::errors::{trace_err, GuestError, Result};
use crate::guest::Guest;
use crate::guest_ptr::GuestPtr;
use crate::kernel_abi::Arch;
use crate::mem::{GuestMem, PtraceMem};
use crate::options::GuestOptions;
use crate::proc_maps::{read_proc_maps, read_proc_tasks};
use log::{debug, warn};
use nix::sys::mman::{MapFlags, ProtFlags};
use nix::sys::ptrace;
use nix::sys::ptrace::Options;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::{fork, ForkResult, Pid};
use std::ffi::CString;
use std::fs;
use std::path::{Path, PathBuf};

/// Fork a trace-me child exec'ing `argv`, run it to its first user
/// instruction (or to the first `wait_sysnr` syscall when that option is
/// set), and capture it.
pub fn spawn(argv: &[&str], opts: &GuestOptions) -> Result<Guest> {
    if argv.is_empty() {
        return Err(GuestError::Unsupported("spawn with empty argv"));
    }
    let exec_path = PathBuf::from(argv[0]);
    let bin_path = opts
        .real_binpath
        .clone()
        .unwrap_or_else(|| exec_path.clone());
    let arch = ElfDebug::arch_of_path(&bin_path).or_else(|_| ElfDebug::arch_of_path(&exec_path))?;

    // exec arguments are prepared before the fork; the child only touches
    // raw pointers
    let cargs: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(*a))
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| GuestError::Unsupported("NUL byte in argv"))?;
    let mut argv_ptrs: Vec<*const libc::c_char> = cargs.iter().map(|c| c.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    let child = match fork().map_err(trace_err("fork"))? {
        ForkResult::Child => {
            let _ = ptrace::traceme();
            // a stable layout lets a captured Guest be replayed into a
            // fresh child of the same binary
            unsafe {
                libc::personality(libc::ADDR_NO_RANDOMIZE as libc::c_ulong);
                libc::execv(cargs[0].as_ptr(), argv_ptrs.as_ptr());
                libc::_exit(127)
            }
        }
        ForkResult::Parent { child } => child,
    };

    expect_stop(wait_stop(child)?)?;
    ptrace::setoptions(
        child,
        Options::PTRACE_O_EXITKILL | Options::PTRACE_O_TRACESYSGOOD,
    )
    .map_err(trace_err("setoptions"))?;

    let mut cpu = CpuState::new(arch, child);
    let entry = match opts.wait_sysnr {
        Some(nr) => {
            run_to_syscall(&mut cpu, child, nr)?;
            compute_entry(child, &exec_path).unwrap_or_else(|_| cpu.pc())
        }
        None => wait_for_entry(&mut cpu, child, &exec_path)?,
    };

    let mut guest = slurp_brains(cpu, child, arch, bin_path, entry, opts, true)?;
    if opts.wait_sysnr.is_none() {
        slurp_arg_ptrs(&mut guest);
    }
    Ok(guest)
}

/// Attach to an existing pid, assumed to be past its loader already.
pub fn attach(pid_raw: i32, opts: &GuestOptions) -> Result<Guest> {
    let pid = Pid::from_raw(pid_raw);
    ptrace::attach(pid).map_err(trace_err("attach"))?;
    expect_stop(wait_stop(pid)?)?;
    let _ = ptrace::setoptions(pid, Options::PTRACE_O_TRACESYSGOOD);

    let bin_path = match opts.real_binpath.clone() {
        Some(p) => p,
        None => fs::read_link(format!("/proc/{}/exe", pid))?,
    };
    let arch = ElfDebug::arch_of_path(&bin_path)?;
    let mut cpu = CpuState::new(arch, pid);
    cpu.load_regs()?;
    let entry = compute_entry(pid, &bin_path).unwrap_or_else(|_| cpu.pc());

    slurp_brains(cpu, pid, arch, bin_path, entry, opts, false)
}

/// Spawn a fresh child from the binary of `src`, replay src's mappings and
/// CPU state into it, and return the new capture. Consumes (and thereby
/// tears down) the source on success.
pub fn from_guest(src: Guest, opts: &GuestOptions) -> Result<Guest> {
    let bin = src.binary_path().to_path_buf();
    let argv0 = bin.to_string_lossy().into_owned();
    let mut dst = spawn(&[&argv0], opts)?;

    let rwx = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC;
    for m in src.memory_map() {
        match m.name.as_deref() {
            Some("[vdso]") | Some("[vvar]") | Some("[vsyscall]") => continue,
            _ => {}
        }
        // stage executable so the dispatch site keeps working while the
        // layout is being rebuilt under it
        dst.mem_mut().mmap(
            m.base,
            m.length,
            rwx,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_FIXED,
            -1,
            0,
        )?;
        let mut buf = vec![0u8; m.length];
        match src.mem().copy_from_guest(&mut buf, m.base) {
            Ok(()) => dst.mem_mut().copy_to_guest(m.base, &buf)?,
            Err(e) => debug!("source mapping {} unreadable: {}", m.base, e),
        }
        dst.mem_mut().mprotect(m.base, m.length, m.prot)?;
    }
    dst.mem_mut().state_mut().import(src.mem().state());

    dst.cpu_state_mut().copy_arch_state(src.cpu_state());
    dst.cpu_state_mut().flush_regs()?;

    drop(src);
    Ok(dst)
}

/// Resume the child until its next syscall boundary.
pub fn cont_to_syscall(pid: Pid) -> Result<WaitStatus> {
    ptrace::syscall(pid, None).map_err(trace_err("syscall-step"))?;
    wait_stop(pid)
}

/// At a syscall-entry stop the kernel has already advanced the program
/// counter past the syscall instruction and clobbered the number register.
/// Rewind both so the state reads as "about to issue the syscall at pc".
pub fn fixup_regs_pre_syscall(cpu: &mut CpuState) -> Result<()> {
    let nr = cpu.orig_syscallno();
    let site = cpu.pc() - cpu.arch().syscall_insn_len();
    cpu.set_syscallno(nr);
    cpu.set_pc(site);
    cpu.flush_regs()
}

fn expect_stop(status: WaitStatus) -> Result<()> {
    match status {
        WaitStatus::Stopped(_, _) | WaitStatus::PtraceSyscall(_) | WaitStatus::PtraceEvent(..) => {
            Ok(())
        }
        other => {
            warn!("child did not stop: {:?}", other);
            Err(GuestError::Unsupported("child vanished during capture"))
        }
    }
}

/// The binary's first-instruction address in this process: absolute for
/// ET_EXEC, rebased by the image's lowest mapping otherwise.
fn compute_entry(pid: Pid, exec_path: &Path) -> Result<GuestPtr> {
    let ed = ElfDebug::from_path(exec_path)?;
    if ed.is_exec() {
        return Ok(ed.entry());
    }
    let canonical = fs::canonicalize(exec_path).unwrap_or_else(|_| exec_path.to_path_buf());
    let canonical = canonical.to_string_lossy().into_owned();
    let maps = read_proc_maps(pid)?;
    let base = maps
        .iter()
        .filter(|m| m.name.as_deref() == Some(canonical.as_str()))
        .map(|m| m.base)
        .min()
        .or_else(|| {
            maps.iter()
                .filter(|m| m.is_file_backed() && m.offset == 0)
                .map(|m| m.base)
                .min()
        })
        .ok_or(GuestError::Unsupported("binary image not found in maps"))?;
    Ok(base + ed.entry().as_u64())
}

/// Plant a breakpoint on the entry point, run the loader out, and land on
/// the first user instruction.
fn wait_for_entry(cpu: &mut CpuState, pid: Pid, exec_path: &Path) -> Result<GuestPtr> {
    let entry = compute_entry(pid, exec_path)?;
    cpu.load_regs()?;
    if cpu.pc() == entry {
        return Ok(entry);
    }

    cpu.set_breakpoint(entry)?;
    ptrace::cont(pid, None).map_err(trace_err("cont"))?;
    loop {
        match wait_stop(pid)? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => break,
            WaitStatus::Stopped(_, sig) => {
                debug!("signal {:?} before entry, delivering", sig);
                ptrace::cont(pid, sig).map_err(trace_err("cont"))?;
            }
            WaitStatus::Exited(_, code) => {
                warn!("child exited with {} before reaching entry", code);
                return Err(GuestError::Unsupported("child exited before entry"));
            }
            WaitStatus::Signaled(_, sig, _) => {
                warn!("child killed by {:?} before reaching entry", sig);
                return Err(GuestError::Unsupported("child died before entry"));
            }
            _ => ptrace::cont(pid, None).map_err(trace_err("cont"))?,
        }
    }
    let hit = cpu.undo_breakpoint()?;
    debug!("entry breakpoint hit at {}", hit);
    Ok(entry)
}

/// Syscall-step until the child enters syscall `nr` (in the guest's own
/// numbering), then rewind to the syscall site.
fn run_to_syscall(cpu: &mut CpuState, pid: Pid, nr: i64) -> Result<()> {
    loop {
        match cont_to_syscall(pid)? {
            WaitStatus::PtraceSyscall(_) | WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                cpu.load_regs()?;
                if cpu.orig_syscallno() == nr {
                    break;
                }
            }
            WaitStatus::Stopped(_, sig) => {
                debug!("signal {:?} while waiting for syscall {}", sig, nr);
            }
            WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                return Err(GuestError::Unsupported("child exited before the syscall"));
            }
            _ => {}
        }
    }
    fixup_regs_pre_syscall(cpu)
}

/// Pull registers, the process-map view, and sibling threads into a Guest.
fn slurp_brains(
    mut cpu: CpuState,
    pid: Pid,
    arch: Arch,
    bin_path: PathBuf,
    entry: GuestPtr,
    opts: &GuestOptions,
    owns_child: bool,
) -> Result<Guest> {
    cpu.load_regs()?;

    let mut mem = PtraceMem::new(arch, pid);
    for m in read_proc_maps(pid)? {
        if m.name.as_deref() == Some("[heap]") {
            mem.state_mut().base_brick = m.base;
            mem.state_mut().top_brick = m.end();
        }
        mem.state_mut().record_mapping(m);
    }

    let threads = slurp_threads(pid, arch)?;
    debug!(
        "captured pid {} at {}: {} mappings, {} threads",
        pid,
        cpu.pc(),
        mem.state().num_mappings(),
        1 + threads.len()
    );

    let abi = GuestAbi::create(&cpu, opts)?;
    Ok(Guest::from_parts(
        arch,
        cpu,
        threads,
        Box::new(mem),
        bin_path,
        entry,
        abi,
        Some(pid),
        owns_child,
    ))
}

/// Attach every sibling from the OS's thread view as a parked CPU state.
fn slurp_threads(pid: Pid, arch: Arch) -> Result<Vec<CpuState>> {
    let mut parked = Vec::new();
    for tid in read_proc_tasks(pid)? {
        if tid == pid {
            continue;
        }
        ptrace::attach(tid).map_err(trace_err("attach-thread"))?;
        expect_stop(wait_stop(tid)?)?;
        let mut cpu = CpuState::new(arch, tid);
        cpu.load_regs()?;
        parked.push(cpu);
    }
    Ok(parked)
}

/// At the entry point the stack still holds argc and the argv pointers;
/// remember where they live. Best effort.
fn slurp_arg_ptrs(guest: &mut Guest) {
    let sp = guest.cpu_state().stack_ptr();
    let wide = !guest.arch().is_32bit();
    let word = if wide { 8u64 } else { 4u64 };

    let read_ptr = |g: &Guest, p: GuestPtr| -> Result<u64> {
        if wide {
            g.mem().read64(p)
        } else {
            g.mem().read32(p).map(|v| v as u64)
        }
    };

    let argc = match read_ptr(guest, sp) {
        Ok(n) if n < 4096 => n,
        _ => return,
    };
    let mut ptrs = Vec::with_capacity(argc as usize);
    for i in 0..argc {
        match read_ptr(guest, sp + word * (1 + i)) {
            Ok(p) if p != 0 => ptrs.push(GuestPtr(p)),
            _ => break,
        }
    }
    guest.set_arg_ptrs(sp, ptrs);
}
