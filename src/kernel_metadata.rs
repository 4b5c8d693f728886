//! Syscall numbering across the supported guest ABIs: the x86-64 numbers the
//! mediator's policy table is written against, reindex tables for 32-bit
//! guests, and a name table for trace output.

use crate::kernel_abi::Arch;
use lazy_static::lazy_static;
use std::collections::HashMap;

/// x86-64 Linux syscall numbers the core references by name.
pub mod x64_nr {
    pub const READ: i64 = 0;
    pub const WRITE: i64 = 1;
    pub const OPEN: i64 = 2;
    pub const CLOSE: i64 = 3;
    pub const STAT: i64 = 4;
    pub const FSTAT: i64 = 5;
    pub const LSTAT: i64 = 6;
    pub const POLL: i64 = 7;
    pub const LSEEK: i64 = 8;
    pub const MMAP: i64 = 9;
    pub const MPROTECT: i64 = 10;
    pub const MUNMAP: i64 = 11;
    pub const BRK: i64 = 12;
    pub const RT_SIGACTION: i64 = 13;
    pub const RT_SIGPROCMASK: i64 = 14;
    pub const IOCTL: i64 = 16;
    pub const ACCESS: i64 = 21;
    pub const PIPE: i64 = 22;
    pub const MREMAP: i64 = 25;
    pub const DUP: i64 = 32;
    pub const DUP2: i64 = 33;
    pub const PAUSE: i64 = 34;
    pub const GETPID: i64 = 39;
    pub const CLONE: i64 = 56;
    pub const FORK: i64 = 57;
    pub const VFORK: i64 = 58;
    pub const EXECVE: i64 = 59;
    pub const EXIT: i64 = 60;
    pub const WAIT4: i64 = 61;
    pub const KILL: i64 = 62;
    pub const UNAME: i64 = 63;
    pub const FCNTL: i64 = 72;
    pub const FSYNC: i64 = 74;
    pub const FTRUNCATE: i64 = 77;
    pub const GETCWD: i64 = 79;
    pub const CHDIR: i64 = 80;
    pub const FCHDIR: i64 = 81;
    pub const RENAME: i64 = 82;
    pub const MKDIR: i64 = 83;
    pub const RMDIR: i64 = 84;
    pub const CREAT: i64 = 85;
    pub const LINK: i64 = 86;
    pub const UNLINK: i64 = 87;
    pub const READLINK: i64 = 89;
    pub const GETUID: i64 = 102;
    pub const GETGID: i64 = 104;
    pub const SETUID: i64 = 105;
    pub const GETPPID: i64 = 110;
    pub const GETPGID: i64 = 121;
    pub const STATFS: i64 = 137;
    pub const ARCH_PRCTL: i64 = 158;
    pub const SYNC: i64 = 162;
    pub const MOUNT: i64 = 165;
    pub const GETTID: i64 = 186;
    pub const TIME: i64 = 201;
    pub const FUTEX: i64 = 202;
    pub const SCHED_GETAFFINITY: i64 = 204;
    pub const GETDENTS64: i64 = 217;
    pub const SET_TID_ADDRESS: i64 = 218;
    pub const CLOCK_GETTIME: i64 = 228;
    pub const EXIT_GROUP: i64 = 231;
    pub const OPENAT: i64 = 257;
    pub const READV: i64 = 19;
    pub const WRITEV: i64 = 20;
}

lazy_static! {
    /// i386 Linux syscall number -> x86-64 equivalent. Numbers without an
    /// entry keep their original value, matching the source's -1 convention.
    static ref I386_TO_X64: HashMap<i64, i64> = {
        use x64_nr::*;
        let mut m = HashMap::new();
        for &(from, to) in &[
            (1, EXIT),
            (2, FORK),
            (3, READ),
            (4, WRITE),
            (5, OPEN),
            (6, CLOSE),
            (8, CREAT),
            (9, LINK),
            (10, UNLINK),
            (11, EXECVE),
            (12, CHDIR),
            (13, TIME),
            (19, LSEEK),
            (20, GETPID),
            (21, MOUNT),
            (23, SETUID),
            (24, GETUID),
            (33, ACCESS),
            (47, GETGID),
            (37, KILL),
            (38, RENAME),
            (39, MKDIR),
            (40, RMDIR),
            (41, DUP),
            (42, PIPE),
            (45, BRK),
            (54, IOCTL),
            (55, FCNTL),
            (63, DUP2),
            (64, GETPPID),
            (85, READLINK),
            (90, MMAP),
            (91, MUNMAP),
            (93, FTRUNCATE),
            (118, FSYNC),
            (120, CLONE),
            (122, UNAME),
            (125, MPROTECT),
            (132, GETPGID),
            (133, FCHDIR),
            (140, LSEEK),
            (145, READV),
            (146, WRITEV),
            (163, MREMAP),
            (168, POLL),
            (174, RT_SIGACTION),
            (175, RT_SIGPROCMASK),
            (183, GETCWD),
            (190, FORK), // vfork; the mediator refuses it either way
            (192, MMAP), // mmap2
            (199, GETUID),
            (200, GETGID),
            (220, GETDENTS64),
            (221, FCNTL),
            (224, GETTID),
            (240, FUTEX),
            (242, SCHED_GETAFFINITY),
            (252, EXIT_GROUP),
            (258, SET_TID_ADDRESS),
            (265, CLOCK_GETTIME),
            (295, OPENAT),
        ] {
            m.insert(from, to);
        }
        m
    };

    /// ARM EABI syscall number -> x86-64 equivalent.
    static ref ARM_TO_X64: HashMap<i64, i64> = {
        use x64_nr::*;
        let mut m = HashMap::new();
        for &(from, to) in &[
            (1, EXIT),
            (2, FORK),
            (3, READ),
            (4, WRITE),
            (5, OPEN),
            (6, CLOSE),
            (8, CREAT),
            (10, UNLINK),
            (11, EXECVE),
            (12, CHDIR),
            (19, LSEEK),
            (20, GETPID),
            (33, ACCESS),
            (37, KILL),
            (41, DUP),
            (42, PIPE),
            (45, BRK),
            (54, IOCTL),
            (55, FCNTL),
            (63, DUP2),
            (64, GETPPID),
            (85, READLINK),
            (91, MUNMAP),
            (118, FSYNC),
            (120, CLONE),
            (122, UNAME),
            (125, MPROTECT),
            (163, MREMAP),
            (168, POLL),
            (174, RT_SIGACTION),
            (175, RT_SIGPROCMASK),
            (183, GETCWD),
            (190, FORK),
            (192, MMAP), // mmap2
            (199, GETUID),
            (200, GETGID),
            (217, GETDENTS64),
            (221, FCNTL),
            (224, GETTID),
            (240, FUTEX),
            (248, EXIT_GROUP),
            (256, SET_TID_ADDRESS),
            (263, CLOCK_GETTIME),
            (322, OPENAT),
        ] {
            m.insert(from, to);
        }
        m
    };

    static ref X64_NAMES: HashMap<i64, &'static str> = {
        use x64_nr::*;
        let mut m = HashMap::new();
        for &(nr, name) in &[
            (READ, "read"),
            (WRITE, "write"),
            (OPEN, "open"),
            (CLOSE, "close"),
            (STAT, "stat"),
            (FSTAT, "fstat"),
            (LSTAT, "lstat"),
            (POLL, "poll"),
            (LSEEK, "lseek"),
            (MMAP, "mmap"),
            (MPROTECT, "mprotect"),
            (MUNMAP, "munmap"),
            (BRK, "brk"),
            (RT_SIGACTION, "rt_sigaction"),
            (RT_SIGPROCMASK, "rt_sigprocmask"),
            (IOCTL, "ioctl"),
            (READV, "readv"),
            (WRITEV, "writev"),
            (ACCESS, "access"),
            (PIPE, "pipe"),
            (MREMAP, "mremap"),
            (DUP, "dup"),
            (DUP2, "dup2"),
            (PAUSE, "pause"),
            (GETPID, "getpid"),
            (CLONE, "clone"),
            (FORK, "fork"),
            (VFORK, "vfork"),
            (EXECVE, "execve"),
            (EXIT, "exit"),
            (WAIT4, "wait4"),
            (KILL, "kill"),
            (UNAME, "uname"),
            (FCNTL, "fcntl"),
            (FSYNC, "fsync"),
            (FTRUNCATE, "ftruncate"),
            (GETCWD, "getcwd"),
            (CHDIR, "chdir"),
            (RENAME, "rename"),
            (MKDIR, "mkdir"),
            (RMDIR, "rmdir"),
            (CREAT, "creat"),
            (LINK, "link"),
            (UNLINK, "unlink"),
            (READLINK, "readlink"),
            (GETUID, "getuid"),
            (GETGID, "getgid"),
            (SETUID, "setuid"),
            (GETPPID, "getppid"),
            (GETPGID, "getpgid"),
            (STATFS, "statfs"),
            (ARCH_PRCTL, "arch_prctl"),
            (SYNC, "sync"),
            (MOUNT, "mount"),
            (GETTID, "gettid"),
            (TIME, "time"),
            (FUTEX, "futex"),
            (SCHED_GETAFFINITY, "sched_getaffinity"),
            (GETDENTS64, "getdents64"),
            (SET_TID_ADDRESS, "set_tid_address"),
            (CLOCK_GETTIME, "clock_gettime"),
            (EXIT_GROUP, "exit_group"),
            (OPENAT, "openat"),
        ] {
            m.insert(nr, name);
        }
        m
    };
}

/// Reindex a guest syscall number into the x86-64 numbering the policy table
/// uses. `None` means no translation is known; the caller keeps the original
/// number.
pub fn translate_syscall(nr: i64, guest: Arch, host: Arch) -> Option<i64> {
    if guest == host {
        return None;
    }
    match (guest, host) {
        (Arch::I386, Arch::X86_64) => I386_TO_X64.get(&nr).copied(),
        (Arch::Arm, Arch::X86_64) => ARM_TO_X64.get(&nr).copied(),
        _ => None,
    }
}

/// Name a syscall for trace output. 32-bit numbers are reindexed first so
/// the name matches what the policy table acted on.
pub fn syscall_name(nr: i64, guest: Arch) -> String {
    let canonical = match guest {
        Arch::X86_64 => nr,
        other => translate_syscall(nr, other, Arch::X86_64).unwrap_or(nr),
    };
    match X64_NAMES.get(&canonical) {
        Some(name) => (*name).to_owned(),
        None => format!("sys_{}", nr),
    }
}

/// The arch's getpid number, used to rewrite ignored syscalls into a no-op.
pub fn nop_syscall_nr(guest: Arch) -> i64 {
    match guest {
        Arch::X86_64 => x64_nr::GETPID,
        Arch::I386 | Arch::Arm => 20,
    }
}

/// Map a canonical x86-64 number back into the guest's own numbering, for
/// the handful of syscalls the core synthesizes and dispatches itself.
pub fn guest_syscall_nr(guest: Arch, x64nr: i64) -> i64 {
    if guest == Arch::X86_64 {
        return x64nr;
    }
    match x64nr {
        x64_nr::MMAP => 192, // mmap2 on both 32-bit ABIs
        x64_nr::MPROTECT => 125,
        x64_nr::MUNMAP => 91,
        x64_nr::MREMAP => 163,
        x64_nr::GETPID => 20,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reindexing() {
        assert_eq!(
            translate_syscall(252, Arch::I386, Arch::X86_64),
            Some(x64_nr::EXIT_GROUP)
        );
        assert_eq!(
            translate_syscall(192, Arch::Arm, Arch::X86_64),
            Some(x64_nr::MMAP)
        );
        // identity ABIs never reindex
        assert_eq!(translate_syscall(60, Arch::X86_64, Arch::X86_64), None);
        // unknown numbers are kept by the caller
        assert_eq!(translate_syscall(9999, Arch::I386, Arch::X86_64), None);
    }

    #[test]
    fn naming() {
        assert_eq!(syscall_name(x64_nr::EXIT_GROUP, Arch::X86_64), "exit_group");
        assert_eq!(syscall_name(252, Arch::I386), "exit_group");
        assert_eq!(syscall_name(9999, Arch::X86_64), "sys_9999");
    }
}
