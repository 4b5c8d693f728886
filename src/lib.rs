//! guestlib captures a native child process through the OS trace primitive
//! — registers, memory map, symbol tables, in-flight syscall position —
//! into an in-process Guest, and lets an embedder drive it forward:
//! single-stepping, intercepting syscalls, translating them across ABIs, or
//! satisfying them from host state.
//!
//! The pieces: `ptimg` acquires the child and builds the [`Guest`];
//! [`CpuState`](cpu::CpuState) holds one thread's registers and the
//! arch-dependent operations (breakpoints, syscall dispatch); the
//! [`GuestMem`](mem::GuestMem) views move data in and out of the guest;
//! [`ElfDebug`](elf_debug::ElfDebug) and [`Symbols`](symbols::Symbols)
//! cover the symbol side; [`Syscalls`](syscalls::Syscalls) applies the
//! per-syscall policy.

pub mod abi;
pub mod core_dump;
pub mod cpu;
pub mod elf_debug;
pub mod errors;
pub mod guest;
pub mod guest_ptr;
pub mod kernel_abi;
pub mod kernel_metadata;
pub mod mem;
pub mod options;
pub mod proc_maps;
pub mod ptimg;
pub mod snapshot;
pub mod symbols;
pub mod syscall_params;
pub mod syscalls;

pub use crate::errors::{GuestError, Result};
pub use crate::guest::Guest;
pub use crate::guest_ptr::GuestPtr;
pub use crate::kernel_abi::Arch;
pub use crate::options::GuestOptions;
pub use crate::symbols::{Symbol, Symbols};
pub use crate::syscall_params::SyscallParams;
pub use crate::syscalls::Syscalls;
