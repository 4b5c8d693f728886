//! Per-syscall policy: refuse, intercept, pass through on the host, or
//! dispatch inside the child. One and only one of those applies per call.

use crate::errors::{GuestError, Result};
use crate::guest::Guest;
use crate::guest_ptr::GuestPtr;
use crate::kernel_abi::{Arch, NATIVE_ARCH};
use crate::kernel_metadata::{syscall_name, translate_syscall, x64_nr};
use crate::options::GuestOptions;
use crate::syscall_params::SyscallParams;
use log::{debug, info};
use nix::sys::mman::{MapFlags, ProtFlags};
use std::collections::VecDeque;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

/// Diagnostic FIFO depth.
pub const MAX_SC_TRACE: usize = 1024;

/// Decides between host passthrough and in-child dispatch once the
/// intercept table has declined a call.
pub struct SyscallXlate {
    guest_arch: Arch,
    force_xlate: bool,
}

impl SyscallXlate {
    pub fn new(guest_arch: Arch, force_xlate: bool) -> SyscallXlate {
        SyscallXlate {
            guest_arch,
            force_xlate,
        }
    }

    /// Reindex into the numbering the policy table is written against. A
    /// missing translation keeps the original number.
    pub fn translate(&self, nr: i64) -> i64 {
        match translate_syscall(nr, self.guest_arch, NATIVE_ARCH) {
            Some(x) if x >= 0 => x,
            _ => nr,
        }
    }

    /// Host passthrough only fits a guest whose memory is host-flat with a
    /// null base on a matching architecture; everything else runs inside
    /// the child.
    pub fn apply(&self, g: &mut Guest, args: &SyscallParams) -> Result<u64> {
        if !self.force_xlate
            && g.mem().is_flat()
            && g.mem().base().is_null()
            && g.arch() == NATIVE_ARCH
        {
            return passthrough_syscall(args);
        }
        g.cpu_state_mut().dispatch_syscall(args)
    }
}

/// Execute the syscall on the host on the guest's behalf. Negative host
/// returns come back as -errno, the way the raw syscall interface reports.
pub fn passthrough_syscall(args: &SyscallParams) -> Result<u64> {
    let ret = unsafe {
        libc::syscall(
            args.nr as libc::c_long,
            args.args[0] as libc::c_long,
            args.args[1] as libc::c_long,
            args.args[2] as libc::c_long,
            args.args[3] as libc::c_long,
            args.args[4] as libc::c_long,
            args.args[5] as libc::c_long,
        )
    };
    if ret == -1 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
        return Ok((-(errno as i64)) as u64);
    }
    Ok(ret as u64)
}

pub struct Syscalls {
    sc_trace: VecDeque<SyscallParams>,
    sc_seen_c: u64,
    exited: bool,
    exit_code: u64,
    log_syscalls: bool,
    /// Path-rewrite root; the rewriting itself lives in the translators.
    #[allow(dead_code)]
    chroot: Option<PathBuf>,
    xlate: SyscallXlate,
    guest_arch: Arch,
}

impl Syscalls {
    pub fn new(g: &Guest, opts: &GuestOptions) -> Syscalls {
        Syscalls {
            sc_trace: VecDeque::new(),
            sc_seen_c: 0,
            exited: false,
            exit_code: 0,
            log_syscalls: opts.log_syscalls,
            chroot: opts.chroot.clone(),
            xlate: SyscallXlate::new(g.arch(), opts.xlate_syscalls),
            guest_arch: g.arch(),
        }
    }

    pub fn has_exited(&self) -> bool {
        self.exited
    }

    /// The value latched from arg0 of exit/exit_group, 32-bit-masked for
    /// 32-bit guests.
    pub fn exit_code(&self) -> u64 {
        self.exit_code
    }

    pub fn num_seen(&self) -> u64 {
        self.sc_seen_c
    }

    pub fn trace(&self) -> impl Iterator<Item = &SyscallParams> {
        self.sc_trace.iter()
    }

    /// Mediate the syscall the guest's registers currently describe.
    pub fn apply_current(&mut self, g: &mut Guest) -> Result<u64> {
        let args = g.syscall_params();
        self.apply(g, args)
    }

    pub fn apply(&mut self, g: &mut Guest, args: SyscallParams) -> Result<u64> {
        let nr = self.xlate.translate(args.syscall());

        // these would break the single-traced-process model; no state has
        // been touched yet
        match nr {
            x64_nr::CLONE | x64_nr::FORK | x64_nr::EXECVE => {
                return Err(GuestError::DisallowedSyscall(nr));
            }
            _ => {}
        }

        self.sc_seen_c += 1;
        self.sc_trace.push_back(args);
        while self.sc_trace.len() > MAX_SC_TRACE {
            self.sc_trace.pop_front();
        }

        let ret = match self.intercept_syscall(g, nr, &args)? {
            Some(ret) => ret,
            None => self.xlate.apply(g, &args)?,
        };

        if self.log_syscalls {
            info!(
                "{} {:?} => {:#x}",
                syscall_name(args.syscall(), self.guest_arch),
                args,
                ret
            );
        }
        Ok(ret)
    }

    fn mask(&self, v: u64) -> u64 {
        if self.guest_arch.is_32bit() {
            v & 0xffff_ffff
        } else {
            v
        }
    }

    /// Don't satisfy any struct-bearing syscall here: this table does not
    /// understand guest layouts, only raw values and the memory bridge.
    fn intercept_syscall(
        &mut self,
        g: &mut Guest,
        nr: i64,
        args: &SyscallParams,
    ) -> Result<Option<u64>> {
        let ret = match nr {
            x64_nr::EXIT | x64_nr::EXIT_GROUP => {
                self.exited = true;
                self.exit_code = self.mask(args.arg(0));
                Some(self.exit_code)
            }
            // never close the host's std streams out from under us
            x64_nr::CLOSE => {
                if (args.arg(0) as i64) < 3 {
                    Some(0)
                } else {
                    None
                }
            }
            x64_nr::DUP2 => {
                if (args.arg(1) as i64) < 3 {
                    Some(0)
                } else {
                    None
                }
            }
            x64_nr::BRK => match g.mem_mut().sbrk(GuestPtr(args.arg(0))) {
                Ok(()) => Some(g.mem().brk().as_u64()),
                Err(e) => {
                    debug!("brk({:#x}) failed: {}", args.arg(0), e);
                    Some((-(libc::ENOMEM as i64)) as u64)
                }
            },
            // lie: a guest handler would let guest code run outside the
            // trace
            x64_nr::RT_SIGACTION => Some(0),
            x64_nr::MMAP => {
                let prot = ProtFlags::from_bits_truncate(args.arg(2) as i32);
                let flags = MapFlags::from_bits_truncate(args.arg(3) as i32);
                match g.mem_mut().mmap(
                    GuestPtr(args.arg(0)),
                    args.arg(1) as usize,
                    prot,
                    flags,
                    args.arg(4) as i32,
                    args.arg(5) as i64,
                ) {
                    Ok(p) => Some(p.as_u64()),
                    Err(GuestError::Sys(e)) => Some((-(e as i64)) as u64),
                    Err(e) => return Err(e),
                }
            }
            x64_nr::MREMAP => {
                match g.mem_mut().mremap(
                    GuestPtr(args.arg(0)),
                    args.arg(1) as usize,
                    args.arg(2) as usize,
                    args.arg(3) as i32,
                ) {
                    Ok(p) => Some(p.as_u64()),
                    Err(GuestError::Sys(e)) => Some((-(e as i64)) as u64),
                    Err(e) => return Err(e),
                }
            }
            x64_nr::MPROTECT => {
                let prot = ProtFlags::from_bits_truncate(args.arg(2) as i32);
                g.mem_mut()
                    .mprotect(GuestPtr(args.arg(0)), args.arg(1) as usize, prot)?;
                Some(0)
            }
            x64_nr::MUNMAP => {
                g.mem_mut()
                    .munmap(GuestPtr(args.arg(0)), args.arg(1) as usize)?;
                Some(0)
            }
            x64_nr::READLINK => self.sys_readlink(g, args)?,
            _ => None,
        };
        Ok(ret)
    }

    /// readlink("/proc/self/exe") answers with the Guest's binary, chased
    /// to its symlink fixed point the way the kernel-side exe link behaves.
    fn sys_readlink(&mut self, g: &mut Guest, args: &SyscallParams) -> Result<Option<u64>> {
        let asked = g.mem().read_cstr(GuestPtr(args.arg(0)))?;
        if asked != b"/proc/self/exe" {
            return Ok(None);
        }

        let mut path = g.binary_path().to_path_buf();
        let mut resolved_once = false;
        loop {
            match std::fs::read_link(&path) {
                Ok(next) => {
                    if next == path {
                        break;
                    }
                    resolved_once = true;
                    path = next;
                }
                Err(e) => {
                    // a non-symlink is the fixed point; after at least one
                    // successful step the last target stands
                    if e.raw_os_error() == Some(libc::EINVAL) || resolved_once {
                        break;
                    }
                    let errno = e.raw_os_error().unwrap_or(libc::EIO);
                    return Ok(Some((-(errno as i64)) as u64));
                }
            }
        }

        let bytes = path.as_os_str().as_bytes();
        let n = std::cmp::min(bytes.len(), args.arg(2) as usize);
        g.mem_mut().copy_to_guest(GuestPtr(args.arg(1)), &bytes[..n])?;
        Ok(Some(n as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::GuestAbi;
    use crate::cpu::CpuState;
    use crate::mem::{GuestMem, Mapping, SnapshotMem};
    use nix::unistd::Pid;

    fn rw() -> ProtFlags {
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
    }

    /// A guest with no child behind it: snapshot memory, zeroed registers.
    fn synthetic_guest_with_binary(flat: bool, bin_path: PathBuf) -> Guest {
        let mut mem = SnapshotMem::new();
        mem.state_mut().force_flat = flat;
        mem.state_mut()
            .record_mapping(Mapping::anon(GuestPtr(0x10_0000), 0x4000, rw()));
        mem.load_segment(GuestPtr(0x10_0000), vec![0u8; 0x4000]);

        let cpu = CpuState::new(Arch::X86_64, Pid::from_raw(0));
        let abi = GuestAbi::create(&cpu, &GuestOptions::default()).unwrap();
        Guest::from_parts(
            Arch::X86_64,
            cpu,
            Vec::new(),
            Box::new(mem),
            bin_path,
            GuestPtr(0x40_0000),
            abi,
            None,
            false,
        )
    }

    fn synthetic_guest(flat: bool) -> Guest {
        synthetic_guest_with_binary(flat, PathBuf::from("/tmp/a.out"))
    }

    fn params(nr: i64, args: [u64; 6]) -> SyscallParams {
        SyscallParams::new(nr as u64, args)
    }

    #[test]
    fn close_of_std_streams_is_faked() {
        let mut g = synthetic_guest(false);
        let mut sc = Syscalls::new(&g, &GuestOptions::default());
        let ret = sc
            .apply(&mut g, params(x64_nr::CLOSE, [0, 0, 0, 0, 0, 0]))
            .unwrap();
        assert_eq!(ret, 0);
        assert_eq!(sc.num_seen(), 1);

        let ret = sc
            .apply(&mut g, params(x64_nr::DUP2, [5, 2, 0, 0, 0, 0]))
            .unwrap();
        assert_eq!(ret, 0);
    }

    #[test]
    fn exit_group_latches() {
        let mut g = synthetic_guest(false);
        let mut sc = Syscalls::new(&g, &GuestOptions::default());
        assert!(!sc.has_exited());
        let ret = sc
            .apply(&mut g, params(x64_nr::EXIT_GROUP, [42, 0, 0, 0, 0, 0]))
            .unwrap();
        assert_eq!(ret, 42);
        assert!(sc.has_exited());
        assert_eq!(sc.exit_code(), 42);
    }

    #[test]
    fn rt_sigaction_lies_success() {
        let mut g = synthetic_guest(false);
        let mut sc = Syscalls::new(&g, &GuestOptions::default());
        let ret = sc
            .apply(&mut g, params(x64_nr::RT_SIGACTION, [11, 0x1234, 0, 8, 0, 0]))
            .unwrap();
        assert_eq!(ret, 0);
    }

    #[test]
    fn fork_and_friends_are_refused_without_mutation() {
        let mut g = synthetic_guest(false);
        let mut sc = Syscalls::new(&g, &GuestOptions::default());
        for nr in &[x64_nr::FORK, x64_nr::CLONE, x64_nr::EXECVE] {
            match sc.apply(&mut g, params(*nr, [0; 6])) {
                Err(GuestError::DisallowedSyscall(n)) => assert_eq!(n, *nr),
                other => panic!("expected refusal, got {:?}", other.map(|_| ())),
            }
        }
        // nothing was recorded, nothing latched
        assert_eq!(sc.num_seen(), 0);
        assert!(!sc.has_exited());
    }

    #[test]
    fn brk_grows_through_the_memory_view() {
        let mut g = synthetic_guest(false);
        g.mem_mut().state_mut().base_brick = GuestPtr(0x60_0000);
        g.mem_mut().state_mut().top_brick = GuestPtr(0x60_0000);
        let maps_before = g.memory_map().len();
        let mut sc = Syscalls::new(&g, &GuestOptions::default());

        // probe returns the current top
        let top = sc
            .apply(&mut g, params(x64_nr::BRK, [0, 0, 0, 0, 0, 0]))
            .unwrap();
        assert_eq!(top, 0x60_0000);

        let newtop = sc
            .apply(&mut g, params(x64_nr::BRK, [0x60_1000, 0, 0, 0, 0, 0]))
            .unwrap();
        assert_eq!(newtop, 0x60_1000);
        assert_eq!(g.memory_map().len(), maps_before + 1);
        let heap = g
            .memory_map()
            .into_iter()
            .find(|m| m.name.as_deref() == Some("[heap]"))
            .unwrap();
        assert!(heap.length >= 0x1000);
        assert!(heap.prot.contains(rw()));
    }

    #[test]
    fn brk_past_reserve_is_enomem() {
        let mut g = synthetic_guest(false);
        g.mem_mut().state_mut().base_brick = GuestPtr(0x60_0000);
        g.mem_mut().state_mut().top_brick = GuestPtr(0x60_0000);
        g.mem_mut().state_mut().reserve_brick = GuestPtr(0x60_1000);
        let mut sc = Syscalls::new(&g, &GuestOptions::default());
        let ret = sc
            .apply(&mut g, params(x64_nr::BRK, [0x70_0000, 0, 0, 0, 0, 0]))
            .unwrap();
        assert_eq!(ret as i64, -(libc::ENOMEM as i64));
    }

    #[test]
    fn mmap_and_munmap_track_mappings() {
        let mut g = synthetic_guest(false);
        let mut sc = Syscalls::new(&g, &GuestOptions::default());
        let flags = (MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS).bits() as u64;
        let prot = rw().bits() as u64;
        let base = sc
            .apply(
                &mut g,
                params(x64_nr::MMAP, [0, 0x2000, prot, flags, -1i64 as u64, 0]),
            )
            .unwrap();
        assert!(base != 0);
        assert!(g.mem().state().find_mapping(GuestPtr(base)).is_some());

        let ret = sc
            .apply(&mut g, params(x64_nr::MUNMAP, [base, 0x2000, 0, 0, 0, 0]))
            .unwrap();
        assert_eq!(ret, 0);
        assert!(g.mem().state().find_mapping(GuestPtr(base)).is_none());
    }

    #[test]
    fn readlink_rewrites_proc_self_exe() {
        let dir = std::env::temp_dir().join(format!("guestlib-rl-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let binpath = dir.join("a.out");
        std::fs::write(&binpath, b"not really elf").unwrap();

        // the guest's binary identity points at our plain file
        let mut g = synthetic_guest_with_binary(false, binpath.clone());
        // stage the asked-for path and a reply buffer in guest memory
        g.mem_mut()
            .copy_to_guest(GuestPtr(0x10_0000), b"/proc/self/exe\0")
            .unwrap();

        let mut sc = Syscalls::new(&g, &GuestOptions::default());
        let ret = sc
            .apply(
                &mut g,
                params(x64_nr::READLINK, [0x10_0000, 0x10_1000, 4096, 0, 0, 0]),
            )
            .unwrap();

        let expect = binpath.as_os_str().as_bytes();
        assert_eq!(ret as usize, expect.len());
        let mut buf = vec![0u8; expect.len()];
        g.mem().copy_from_guest(&mut buf, GuestPtr(0x10_1000)).unwrap();
        assert_eq!(buf, expect);

        // a readlink of anything else is not intercepted (and a synthetic
        // guest cannot dispatch), so it must not be answered here
        g.mem_mut()
            .copy_to_guest(GuestPtr(0x10_0000), b"/etc/hostname\0")
            .unwrap();
        assert!(sc
            .apply(
                &mut g,
                params(x64_nr::READLINK, [0x10_0000, 0x10_1000, 4096, 0, 0, 0]),
            )
            .is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn flat_matching_guest_passes_pure_syscalls_through() {
        let mut g = synthetic_guest(true);
        let mut sc = Syscalls::new(&g, &GuestOptions::default());
        let ret = sc
            .apply(&mut g, params(x64_nr::GETPID, [0; 6]))
            .unwrap();
        assert_eq!(ret as i32, nix::unistd::getpid().as_raw());

        let ret = sc
            .apply(&mut g, params(x64_nr::GETUID, [0; 6]))
            .unwrap();
        assert_eq!(ret as u32, nix::unistd::getuid().as_raw());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn forced_xlate_disables_passthrough() {
        let mut g = synthetic_guest(true);
        let mut opts = GuestOptions::default();
        opts.xlate_syscalls = true;
        let mut sc = Syscalls::new(&g, &opts);
        // with translation forced the call must go to the (absent) child
        assert!(sc.apply(&mut g, params(x64_nr::GETPID, [0; 6])).is_err());
    }

    #[test]
    fn trace_fifo_is_bounded() {
        let mut g = synthetic_guest(false);
        let mut sc = Syscalls::new(&g, &GuestOptions::default());
        for _ in 0..(MAX_SC_TRACE + 100) {
            sc.apply(&mut g, params(x64_nr::RT_SIGACTION, [0; 6])).unwrap();
        }
        assert_eq!(sc.trace().count(), MAX_SC_TRACE);
        assert_eq!(sc.num_seen(), (MAX_SC_TRACE + 100) as u64);
    }
}
