//! A thin accessor over a single traced process: liveness, register cache,
//! syscall decoding, cross-process memory reads, and syscall cancellation.
//! Generalizes `lib.rs`'s AArch64-only `handle_syscall` register indexing
//! to the x86/x86_64 ABI described in `Tracee.cc`.

use std::io::IoSliceMut;

use libc::user_regs_struct;
use nix::sys::ptrace;
use nix::sys::signal;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// The syscall calling convention in effect for the tracee's current stop.
/// A 64-bit kernel tracing a 32-bit (compat-mode) process still reports
/// registers in the native 64-bit layout, just with the legacy syscall ABI
/// values packed into the lower 32 bits -- hence this is a property of the
/// *stop*, not a fixed property of the binary, and is re-detected on exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Arch {
    #[default]
    Unknown,
    X86,
    X86_64,
}

/// Segment selector values the Linux x86-64 GDT assigns to the 64-bit and
/// compat-mode user code segments. A tracee's `cs` register at a
/// syscall-stop tells us which ABI it just used.
const CS_X86_64: u64 = 0x33;
const CS_X86: u64 = 0x23;

impl Arch {
    pub fn from_cs(cs: u64) -> Arch {
        match cs {
            CS_X86_64 => Arch::X86_64,
            CS_X86 => Arch::X86,
            _ => Arch::Unknown,
        }
    }
}

pub struct Tracee {
    pid: Pid,
    regs: user_regs_struct,
    arch: Arch,
}

impl Tracee {
    /// Constructs a handle and takes the first register snapshot. Per the
    /// data model invariant, this must only be called right after a
    /// ptrace-stop.
    pub fn new(pid: Pid) -> Result<Tracee> {
        let regs = ptrace::getregs(pid).map_err(|errno| EngineError::system("ptrace getregs", errno))?;
        let arch = Arch::from_cs(regs.cs);
        Ok(Tracee { pid, regs, arch })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Refreshes the cached registers from the kernel. Called by the
    /// tracer on every subsequent stop of this tracee.
    pub fn refresh(&mut self) -> Result<()> {
        self.regs = ptrace::getregs(self.pid).map_err(|errno| EngineError::system("ptrace getregs", errno))?;
        self.arch = Arch::from_cs(self.regs.cs);
        Ok(())
    }

    /// True iff a null-signal probe to the pid succeeds.
    pub fn is_alive(&self) -> bool {
        signal::kill(self.pid, None).is_ok()
    }

    /// `PTRACE_GETEVENTMSG`: the kernel-supplied auxiliary value for the
    /// current stop (e.g. the new child's pid on a clone/fork/vfork stop,
    /// or the seccomp rule's `TRACE` user-data code on a seccomp stop).
    pub fn get_event_msg(&self) -> Result<u64> {
        ptrace::getevent(self.pid)
            .map(|msg| msg as u64)
            .map_err(|errno| EngineError::system("ptrace geteventmsg", errno))
    }

    pub fn set_syscall_arch(&mut self, arch: Arch) {
        self.arch = arch;
    }

    pub fn syscall_arch(&self) -> Arch {
        self.arch
    }

    /// The syscall number from the original-accumulator slot the kernel
    /// preserves across entry, regardless of arch.
    pub fn get_syscall_number(&self) -> Result<i64> {
        if self.arch == Arch::Unknown {
            return Err(EngineError::protocol("can't get syscall number, unknown syscall arch"));
        }
        Ok(self.regs.orig_rax as i64)
    }

    /// Argument `i` (0..=5) per the native Linux calling convention: on
    /// x86 the order is `ebx, ecx, edx, esi, edi, ebp`; on x86_64 it's
    /// `rdi, rsi, rdx, r10, r8, r9`.
    pub fn get_syscall_argument(&self, i: u8) -> Result<u64> {
        match self.arch {
            Arch::Unknown => Err(EngineError::protocol("can't get syscall argument, unknown syscall arch")),
            Arch::X86 => {
                let value = match i {
                    0 => self.regs.rbx,
                    1 => self.regs.rcx,
                    2 => self.regs.rdx,
                    3 => self.regs.rsi,
                    4 => self.regs.rdi,
                    5 => self.regs.rbp,
                    _ => return Err(EngineError::protocol(format!("no such syscall argument number {i}"))),
                };
                Ok(value as u32 as u64)
            }
            Arch::X86_64 => {
                let value = match i {
                    0 => self.regs.rdi,
                    1 => self.regs.rsi,
                    2 => self.regs.rdx,
                    3 => self.regs.r10,
                    4 => self.regs.r8,
                    5 => self.regs.r9,
                    _ => return Err(EngineError::protocol(format!("no such syscall argument number {i}"))),
                };
                Ok(value)
            }
        }
    }

    /// Reads a NUL-terminated byte string out of the tracee's address
    /// space, up to `limit` bytes, using a single `process_vm_readv` call.
    /// The word-at-a-time `PTRACE_PEEKTEXT` approach documented (and
    /// disavowed) in the source is intentionally not ported.
    pub fn read_memory_string(&self, addr: u64, limit: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; limit];
        let remote = RemoteIoVec { base: addr as usize, len: limit };
        let local = [IoSliceMut::new(&mut buf)];
        let read = process_vm_readv(self.pid, &local, &[remote])
            .map_err(|errno| EngineError::system("process_vm_readv", errno))?;
        buf.truncate(read);
        match buf.iter().position(|&b| b == 0) {
            Some(nul) => {
                buf.truncate(nul);
                Ok(buf)
            }
            None => Err(EngineError::protocol(format!(
                "no NUL byte found within {limit} bytes at {addr:#x}"
            ))),
        }
    }

    /// Rewrites the original-accumulator slot to an invalid syscall number
    /// so the kernel short-circuits the pending syscall, and installs
    /// `return_value` in the return-value register.
    pub fn cancel_syscall(&mut self, return_value: i64) -> Result<()> {
        self.regs.orig_rax = (-1i64) as u64;
        self.regs.rax = return_value as u64;
        ptrace::setregs(self.pid, self.regs).map_err(|errno| EngineError::system("ptrace setregs", errno))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regs_with(orig_rax: u64, cs: u64) -> user_regs_struct {
        // SAFETY: user_regs_struct is a plain collection of integers; a
        // zeroed value is a valid (if meaningless) instance.
        let mut regs: user_regs_struct = unsafe { std::mem::zeroed() };
        regs.orig_rax = orig_rax;
        regs.cs = cs;
        regs
    }

    fn tracee_with(regs: user_regs_struct) -> Tracee {
        let arch = Arch::from_cs(regs.cs);
        Tracee { pid: Pid::from_raw(0), regs, arch }
    }

    #[test]
    fn detects_arch_from_segment_selector() {
        assert_eq!(Arch::from_cs(CS_X86_64), Arch::X86_64);
        assert_eq!(Arch::from_cs(CS_X86), Arch::X86);
        assert_eq!(Arch::from_cs(0x1b), Arch::Unknown);
    }

    #[test]
    fn syscall_number_requires_known_arch() {
        let mut t = tracee_with(regs_with(59, 0));
        assert!(t.get_syscall_number().is_err());
        t.set_syscall_arch(Arch::X86_64);
        assert_eq!(t.get_syscall_number().unwrap(), 59);
    }

    #[test]
    fn x86_64_argument_order() {
        let mut regs = regs_with(0, CS_X86_64);
        regs.rdi = 1;
        regs.rsi = 2;
        regs.rdx = 3;
        regs.r10 = 4;
        regs.r8 = 5;
        regs.r9 = 6;
        let t = tracee_with(regs);
        for (i, expected) in [1, 2, 3, 4, 5, 6].into_iter().enumerate() {
            assert_eq!(t.get_syscall_argument(i as u8).unwrap(), expected);
        }
        assert!(t.get_syscall_argument(6).is_err());
    }

    #[test]
    fn x86_argument_order_truncates_to_32_bits() {
        let mut regs = regs_with(0, CS_X86);
        regs.rbx = 0xFFFF_FFFF_0000_0001;
        let t = tracee_with(regs);
        assert_eq!(t.get_syscall_argument(0).unwrap(), 1);
    }
}
