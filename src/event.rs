//! The two event records the engine produces (`ExecuteEvent` for
//! wait-notifications, `TraceEvent` for ptrace-stops) and the two
//! totally-ordered verdict enums listeners return.

use nix::unistd::Pid;

/// A wait-notification about the child, dispatched to listeners and then
/// discarded -- never retained past the loop iteration that produced it.
#[derive(Debug, Clone, Copy)]
pub struct ExecuteEvent {
    pub pid: Pid,
    pub exited: bool,
    pub killed: bool,
    pub stopped: bool,
    pub trapped: bool,
    /// Meaningful when `exited`.
    pub exit_status: i32,
    /// Meaningful when `killed | stopped | trapped`.
    pub signal: i32,
}

impl ExecuteEvent {
    pub fn exited(pid: Pid, exit_status: i32) -> Self {
        ExecuteEvent { pid, exited: true, killed: false, stopped: false, trapped: false, exit_status, signal: 0 }
    }

    pub fn killed(pid: Pid, signal: i32) -> Self {
        ExecuteEvent { pid, exited: false, killed: true, stopped: false, trapped: false, exit_status: 0, signal }
    }

    pub fn stopped(pid: Pid, signal: i32) -> Self {
        ExecuteEvent { pid, exited: false, killed: false, stopped: true, trapped: false, exit_status: 0, signal }
    }

    pub fn trapped(pid: Pid, signal: i32) -> Self {
        ExecuteEvent { pid, exited: false, killed: false, stopped: false, trapped: true, exit_status: 0, signal }
    }

    /// The exit status as the output builder would record it: the raw
    /// `_exit` code when the child exited cleanly, `128 + signal` when a
    /// signal killed it.
    pub fn recorded_exit_status(&self) -> i32 {
        if self.killed {
            128 + self.signal
        } else {
            self.exit_status
        }
    }
}

/// A listener's verdict for an `ExecuteEvent` or asynchronous signal.
/// Totally ordered; aggregation is `max`, and once any listener returns
/// `Kill` the decision is sticky for the remainder of the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ExecuteAction {
    #[default]
    Continue,
    Kill,
}

/// A listener's verdict for a `TraceEvent`. `ContinueQuietly` sits between
/// `Continue` and `Kill`: it resumes the tracee without re-injecting any
/// pending signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TraceAction {
    #[default]
    Continue,
    ContinueQuietly,
    Kill,
}

/// The kind of ptrace-stop a `TraceEvent` describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEventKind {
    SyscallEntry,
    SyscallExit,
    Seccomp,
    Clone,
    Fork,
    VFork,
    Exec,
    Exit,
    SignalDelivery,
    OtherStop,
}

/// A record for each ptrace-stop observed while a tracee is under control.
#[derive(Debug, Clone, Copy)]
pub struct TraceEvent {
    pub pid: Pid,
    pub kind: TraceEventKind,
    /// The pending signal number, meaningful for `SignalDelivery` (and
    /// potentially `OtherStop` group-stops).
    pub signal: Option<i32>,
    /// The kernel-supplied auxiliary value for this stop (e.g. the new
    /// child pid on clone, or the seccomp `TRACE` user-data code),
    /// fetched via `PTRACE_GETEVENTMSG` when applicable.
    pub message: Option<u64>,
}
