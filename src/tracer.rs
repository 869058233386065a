//! The ptrace state machine: given a tracee, resumes it, classifies each
//! stop, dispatches to listeners, and decides the resume mode. Builds on
//! `lib.rs::parent`'s `waitpid`/`WaitStatus` handling, generalized from
//! AArch64-only frame-pointer walking to the x86/x86_64 syscall ABI, with
//! the seccomp-stop and exit-stop cases a frame-pointer walker never had
//! to classify.

use std::collections::{BTreeMap, HashMap, HashSet};

use nix::libc::c_int;
use nix::sys::ptrace::{self, Event};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::error::{self, EngineError, Result};
use crate::event::{TraceAction, TraceEvent, TraceEventKind};
use crate::listener::ListenerBus;
use crate::tracee::Tracee;

/// The options requested of every tracee: stop on seccomp `TRACE` actions,
/// on `execve`, on clone/fork/vfork (registering the new tracee), and on
/// exit; `EXITKILL` ensures a dying supervisor takes its tracees with it;
/// `TRACESYSGOOD` disambiguates syscall-stops from plain signal-stops the
/// way `lib.rs` relies on (`WaitStatus::PtraceSyscall`).
pub fn trace_options() -> ptrace::Options {
    ptrace::Options::PTRACE_O_EXITKILL
        | ptrace::Options::PTRACE_O_TRACESYSGOOD
        | ptrace::Options::PTRACE_O_TRACEFORK
        | ptrace::Options::PTRACE_O_TRACECLONE
        | ptrace::Options::PTRACE_O_TRACEVFORK
        | ptrace::Options::PTRACE_O_TRACEEXEC
        | ptrace::Options::PTRACE_O_TRACEEXIT
        | ptrace::Options::PTRACE_O_TRACESECCOMP
}

/// Per-tracee syscall-stop parity: syscall-entry and syscall-exit stops
/// are indistinguishable in the raw wait status and alternate for a given
/// tracee, so the tracer must track which one comes next.
#[derive(Default)]
struct TraceeState {
    tracee: Option<Tracee>,
    awaiting_syscall_exit: bool,
}

/// What a raw wait status told us, before the per-tracee entry/exit
/// parity has been resolved into a concrete `TraceEventKind`.
enum RawStop {
    SyscallBoundary,
    Event(TraceEventKind),
    SignalDelivery,
}

/// A handler bound to one specific seccomp `TRACE` user-data code. Looked
/// up directly by `Tracer::handle_stop` for a `Seccomp` stop carrying that
/// code, instead of broadcast to every registered listener.
pub trait TraceHandler {
    fn handle(&mut self, event: &TraceEvent, tracee: &mut Tracee) -> TraceAction;
}

/// Owns the set of live tracees and walks each through the per-tracee
/// ptrace-stop state machine.
#[derive(Default)]
pub struct Tracer {
    tracees: HashMap<Pid, TraceeState>,
    /// New children from clone/fork/vfork raise a synchronizing `SIGSTOP`
    /// before their first real stop; that stop carries no information and
    /// must be swallowed rather than dispatched. Mirrors `lib.rs`'s
    /// `ignore_next_stop` set.
    ignore_next_stop: HashSet<Pid>,
    /// The side table mapping a seccomp `TRACE` user-data code back to the
    /// handler registered for it.
    trace_handlers: BTreeMap<u32, Box<dyn TraceHandler>>,
}

impl Tracer {
    pub fn new() -> Self {
        Tracer::default()
    }

    pub fn track(&mut self, pid: Pid) {
        self.tracees.entry(pid).or_default();
    }

    pub fn register_trace_handler(&mut self, code: u32, handler: Box<dyn TraceHandler>) {
        self.trace_handlers.insert(code, handler);
    }

    pub fn is_tracking(&self, pid: Pid) -> bool {
        self.tracees.contains_key(&pid)
    }

    pub fn forget(&mut self, pid: Pid) {
        self.tracees.remove(&pid);
        self.ignore_next_stop.remove(&pid);
    }

    pub fn live_count(&self) -> usize {
        self.tracees.len()
    }

    /// Handles one ptrace-related `WaitStatus` for `pid`: classifies it,
    /// refreshes the tracee's registers, dispatches to `listeners`, and
    /// resumes in the mode the aggregated verdict calls for. Returns
    /// `Ok(true)` if a `TraceEvent` was actually dispatched (`false` for
    /// the swallowed synchronizing `SIGSTOP`).
    pub fn handle_stop(&mut self, pid: Pid, status: &WaitStatus, listeners: &mut ListenerBus) -> Result<bool> {
        if let WaitStatus::Stopped(_, Signal::SIGSTOP) = status {
            if self.ignore_next_stop.remove(&pid) {
                resume(pid, None)?;
                return Ok(false);
            }
        }

        let (raw, signal) = classify_raw(status)?;
        // Only a genuine signal-delivery stop carries a signal that's safe
        // to re-inject on resume. `PTRACE_EVENT_*` stops always report
        // `SIGTRAP` in the same slot; forwarding that to `PTRACE_SYSCALL`
        // would deliver a real `SIGTRAP` to the tracee instead of just
        // continuing it.
        let resumable_signal = matches!(raw, RawStop::SignalDelivery).then_some(signal).flatten();

        let state = self.tracees.entry(pid).or_default();
        let kind = match raw {
            RawStop::SyscallBoundary => {
                let kind =
                    if state.awaiting_syscall_exit { TraceEventKind::SyscallExit } else { TraceEventKind::SyscallEntry };
                state.awaiting_syscall_exit = !state.awaiting_syscall_exit;
                kind
            }
            RawStop::Event(kind) => kind,
            RawStop::SignalDelivery => TraceEventKind::SignalDelivery,
        };

        let tracee = match &mut state.tracee {
            Some(tracee) => {
                tracee.refresh()?;
                tracee
            }
            None => {
                state.tracee = Some(Tracee::new(pid)?);
                state.tracee.as_mut().unwrap()
            }
        };

        let needs_event_msg = matches!(
            kind,
            TraceEventKind::Seccomp | TraceEventKind::Clone | TraceEventKind::Fork | TraceEventKind::VFork
        );
        let message = if needs_event_msg { Some(tracee.get_event_msg()?) } else { None };

        let event = TraceEvent { pid, kind, signal, message };

        let mut action = listeners.on_trace_event(&event, tracee);
        if kind == TraceEventKind::Seccomp {
            if let Some(handler) = message.and_then(|code| self.trace_handlers.get_mut(&(code as u32))) {
                action = action.max(handler.handle(&event, tracee));
            }
        }
        match kind {
            TraceEventKind::Exec => {
                action = action.max(listeners.on_post_exec(&event, tracee));
            }
            TraceEventKind::Clone | TraceEventKind::Fork | TraceEventKind::VFork => {
                if let Some(raw_child) = message {
                    let child_pid = Pid::from_raw(raw_child as i32);
                    action = action.max(listeners.on_post_clone(pid, child_pid));
                    self.ignore_next_stop.insert(child_pid);
                    self.tracees.entry(child_pid).or_default();
                }
            }
            _ => {}
        }

        match action {
            TraceAction::Continue => resume(pid, resumable_signal.and_then(|s| Signal::try_from(s).ok()))?,
            TraceAction::ContinueQuietly => resume(pid, None)?,
            TraceAction::Kill => {
                error::check("ptrace detach", ptrace::detach(pid, None))?;
                nix::sys::signal::kill(pid, Signal::SIGKILL)
                    .or_else(ignore_esrch)
                    .map_err(|errno| EngineError::system("kill tracee", errno))?;
            }
        }

        Ok(true)
    }
}

fn ignore_esrch(errno: nix::errno::Errno) -> std::result::Result<(), nix::errno::Errno> {
    if errno == nix::errno::Errno::ESRCH {
        Ok(())
    } else {
        Err(errno)
    }
}

fn resume(pid: Pid, signal: Option<Signal>) -> Result<()> {
    ptrace::syscall(pid, signal).map_err(|errno| EngineError::system("ptrace syscall (resume)", errno))
}

fn event_kind_from_code(event: c_int) -> Option<TraceEventKind> {
    let known = [
        (Event::PTRACE_EVENT_FORK, TraceEventKind::Fork),
        (Event::PTRACE_EVENT_VFORK, TraceEventKind::VFork),
        (Event::PTRACE_EVENT_CLONE, TraceEventKind::Clone),
        (Event::PTRACE_EVENT_EXEC, TraceEventKind::Exec),
        (Event::PTRACE_EVENT_EXIT, TraceEventKind::Exit),
        (Event::PTRACE_EVENT_SECCOMP, TraceEventKind::Seccomp),
        (Event::PTRACE_EVENT_STOP, TraceEventKind::OtherStop),
    ];
    known.into_iter().find(|(e, _)| *e as c_int == event).map(|(_, kind)| kind)
}

/// Classifies a single `WaitStatus` already known to belong to a tracked
/// ptrace-stop (not a plain process exit) into a raw stop kind plus any
/// pending signal number.
fn classify_raw(status: &WaitStatus) -> Result<(RawStop, Option<i32>)> {
    match status {
        WaitStatus::PtraceSyscall(_) => Ok((RawStop::SyscallBoundary, None)),
        WaitStatus::PtraceEvent(_, signal, event) => match event_kind_from_code(*event) {
            Some(kind) => Ok((RawStop::Event(kind), Some(*signal as i32))),
            None => Err(EngineError::protocol(format!("unclassifiable ptrace event code {event}"))),
        },
        WaitStatus::Stopped(_, signal) => Ok((RawStop::SignalDelivery, Some(*signal as i32))),
        other => Err(EngineError::protocol(format!("unexpected ptrace-related wait status {other:?}"))),
    }
}
