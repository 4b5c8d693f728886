use crate::guest_ptr::GuestPtr;
use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, GuestError>;

/// Everything the acquisition/control core can fail with. `Sys` is not a
/// host-side failure: it carries an errno destined for the traced child.
#[derive(Debug)]
pub enum GuestError {
    /// The OS trace primitive rejected an operation on a live pid.
    TraceFailed {
        op: &'static str,
        errno: nix::Error,
    },
    /// The image or process carries an architecture the core does not know.
    UnsupportedArch(u16),
    /// Bad section indices, impossible sizes. Symbol loads degrade to empty.
    ElfMalformed(String),
    /// An ABI descriptor named a register the CPU state does not know.
    UnknownRegister(String),
    /// clone/fork/execve observed; these would break the single-traced-process
    /// model.
    DisallowedSyscall(i64),
    /// After dispatching a syscall the child did not stop where expected.
    SyscallSiteMismatch { expected: GuestPtr, found: GuestPtr },
    /// The guest heap could not grow. Surfaces to the child as -ENOMEM.
    OutOfMemoryGuest,
    /// A deliberately unimplemented entry point (ptrace sbrk/mremap, dead
    /// ABIs).
    Unsupported(&'static str),
    /// Guest-visible errno from a dispatched or passed-through syscall.
    Sys(i32),
    /// A guest address with no mapping behind it.
    BadGuestAddress(GuestPtr),
    /// Wide reads through the trace primitive must be naturally aligned.
    MisalignedAccess(GuestPtr),
    Io(io::Error),
}

impl fmt::Display for GuestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestError::TraceFailed { op, errno } => {
                write!(f, "trace primitive failed during {}: {}", op, errno)
            }
            GuestError::UnsupportedArch(m) => write!(f, "unsupported architecture (machine {})", m),
            GuestError::ElfMalformed(why) => write!(f, "malformed ELF image: {}", why),
            GuestError::UnknownRegister(name) => write!(f, "unknown register name '{}'", name),
            GuestError::DisallowedSyscall(nr) => write!(f, "disallowed syscall {}", nr),
            GuestError::SyscallSiteMismatch { expected, found } => write!(
                f,
                "syscall dispatch stopped at {} (expected {})",
                found, expected
            ),
            GuestError::OutOfMemoryGuest => write!(f, "guest heap exhausted"),
            GuestError::Unsupported(what) => write!(f, "unsupported operation: {}", what),
            GuestError::Sys(errno) => write!(f, "guest errno {}", errno),
            GuestError::BadGuestAddress(p) => write!(f, "unmapped guest address {}", p),
            GuestError::MisalignedAccess(p) => write!(f, "misaligned wide access at {}", p),
            GuestError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for GuestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GuestError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for GuestError {
    fn from(e: io::Error) -> GuestError {
        GuestError::Io(e)
    }
}

impl From<nix::Error> for GuestError {
    fn from(e: nix::Error) -> GuestError {
        GuestError::TraceFailed {
            op: "ptrace",
            errno: e,
        }
    }
}

impl From<goblin::error::Error> for GuestError {
    fn from(e: goblin::error::Error) -> GuestError {
        GuestError::ElfMalformed(e.to_string())
    }
}

/// Shorthand for tagging a nix failure with the primitive that raised it.
pub fn trace_err(op: &'static str) -> impl FnOnce(nix::Error) -> GuestError {
    move |errno| GuestError::TraceFailed { op, errno }
}
