use std::env;
use std::path::PathBuf;

/// Acquisition and mediation knobs, threaded explicitly into the capture
/// driver and the syscall mediator. `from_env` reads the historically
/// recognized environment variables; embedders may also build one by hand.
#[derive(Clone, Debug)]
pub struct GuestOptions {
    /// Binary path used for symbol loading when argv[0] is a wrapper
    /// (VEXLLVM_REAL_BINPATH).
    pub real_binpath: Option<PathBuf>,
    /// Stop capture at the first occurrence of this syscall number instead
    /// of at the binary's entry point (VEXLLVM_WAIT_SYSNR).
    pub wait_sysnr: Option<i64>,
    /// Log every syscall and its result (GUEST_SYSCALLS).
    pub log_syscalls: bool,
    /// Path-rewrite root for path-taking syscalls; the rewriting itself
    /// lives in the translators (GUEST_CHROOT).
    pub chroot: Option<PathBuf>,
    /// Force the translation path even when host and guest archs match
    /// (GUEST_XLATE_SYSCALLS).
    pub xlate_syscalls: bool,
    /// i386 entry convention: sysenter rather than int 0x80.
    pub use_linux_sysenter: bool,
}

impl Default for GuestOptions {
    fn default() -> GuestOptions {
        GuestOptions {
            real_binpath: None,
            wait_sysnr: None,
            log_syscalls: false,
            chroot: None,
            xlate_syscalls: false,
            use_linux_sysenter: true,
        }
    }
}

impl GuestOptions {
    pub fn from_env() -> GuestOptions {
        GuestOptions {
            real_binpath: env::var_os("VEXLLVM_REAL_BINPATH").map(PathBuf::from),
            wait_sysnr: env::var("VEXLLVM_WAIT_SYSNR")
                .ok()
                .and_then(|v| v.parse().ok()),
            log_syscalls: env::var_os("GUEST_SYSCALLS").is_some(),
            chroot: env::var_os("GUEST_CHROOT").map(PathBuf::from),
            xlate_syscalls: env::var_os("GUEST_XLATE_SYSCALLS").is_some(),
            use_linux_sysenter: true,
        }
    }
}
