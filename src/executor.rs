//! The top-level supervisor: fork, transition the child into a traced
//! state, run the parent wait loop, aggregate verdicts, report outcome.
//! The wait loop itself is rebuilt against `Executor.cc::executeParent`
//! (non-consuming `waitid`, `CLD_*` classification, `128 + signal`); the
//! fork/child-setup shape follows `lib.rs::{child,parent,execute}`.

use std::ffi::CString;

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitid, waitpid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::{execve, fork, ForkResult, Pid};

use crate::error::{EngineError, Result};
use crate::event::{ExecuteAction, ExecuteEvent};
use crate::listener::ListenerBus;
use crate::output::OutputSink;
use crate::seccomp::CompiledFilter;
use crate::signals;
use crate::tracer::{trace_options, TraceHandler, Tracer};

pub struct Executor {
    program: CString,
    argv: Vec<CString>,
    env: Vec<CString>,
    listeners: ListenerBus,
    output: Box<dyn OutputSink>,
    policy: Option<CompiledFilter>,
    trace_handlers: Vec<(u32, Box<dyn TraceHandler>)>,
}

impl Executor {
    pub fn new(program: CString, argv: Vec<CString>, env: Vec<CString>, output: Box<dyn OutputSink>) -> Self {
        Executor { program, argv, env, listeners: ListenerBus::new(), output, policy: None, trace_handlers: Vec::new() }
    }

    pub fn with_listener(mut self, listener: Box<dyn crate::listener::Listener>) -> Self {
        self.listeners.register(listener);
        self
    }

    pub fn with_seccomp_policy(mut self, policy: CompiledFilter) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Binds a handler to one seccomp `TRACE` user-data code; `Tracer`
    /// looks it up directly for any `Seccomp` stop carrying that code.
    pub fn with_trace_handler(mut self, code: u32, handler: Box<dyn TraceHandler>) -> Self {
        self.trace_handlers.push((code, handler));
        self
    }

    /// Forks, execs the target under trace, and runs the parent wait loop
    /// to completion. Single-shot: consumes `self`.
    pub fn execute(mut self) -> Result<ExecuteEvent> {
        self.listeners.on_pre_fork()?;

        // SAFETY: the child performs only async-signal-safe work (ptrace
        // calls, seccomp load, execve) before replacing itself; no Rust
        // allocator or buffered-IO use happens on the child path.
        match unsafe { fork() }.map_err(|errno| EngineError::system("fork", errno))? {
            ForkResult::Child => self.run_child(),
            ForkResult::Parent { child, .. } => self.run_parent(child),
        }
    }

    /// Never returns: either `execve` succeeds and this process image is
    /// replaced, or setup fails and the child exits with a diagnostic.
    fn run_child(mut self) -> ! {
        self.listeners.on_post_fork_child();

        if ptrace::traceme().is_err() {
            nix::unistd::_exit(127);
        }
        if let Some(policy) = &self.policy {
            if policy.load().is_err() {
                nix::unistd::_exit(127);
            }
        }

        let argv: Vec<&std::ffi::CStr> = self.argv.iter().map(CString::as_c_str).collect();
        let env: Vec<&std::ffi::CStr> = self.env.iter().map(CString::as_c_str).collect();
        let _ = execve(self.program.as_c_str(), &argv, &env);
        // execve only returns on failure; a diagnostic would go through
        // the logging/output collaborators in a full pipeline, but this
        // process is about to vanish, so there is nothing left to hand it
        // to other than the exit code itself.
        nix::unistd::_exit(126);
    }

    fn run_parent(mut self, child: Pid) -> Result<ExecuteEvent> {
        self.listeners.on_post_fork_parent(child);

        // Wait for the stop `PTRACE_TRACEME` + the first `execve` produce,
        // then arm tracing options and let the tracee run.
        waitpid(child, None).map_err(|errno| EngineError::system("waitpid (initial stop)", errno))?;
        ptrace::setoptions(child, trace_options()).map_err(|errno| EngineError::system("ptrace setoptions", errno))?;

        let mut tracer = Tracer::new();
        tracer.track(child);
        for (code, handler) in self.trace_handlers.drain(..) {
            tracer.register_trace_handler(code, handler);
        }
        ptrace::syscall(child, None).map_err(|errno| EngineError::system("ptrace syscall (start)", errno))?;

        signals::install()?;
        let result = self.run_wait_loop(child, &mut tracer);
        signals::teardown()?;
        self.listeners.on_post_execute();
        result
    }

    fn run_wait_loop(&mut self, child: Pid, tracer: &mut Tracer) -> Result<ExecuteEvent> {
        loop {
            let drained = signals::drain();
            let mut action = ExecuteAction::default();
            if drained.sigio {
                action = self.listeners.on_sigio_signal(action);
            }
            if drained.sigalrm {
                action = self.listeners.on_sigalrm_signal(action);
            }
            if action == ExecuteAction::Kill {
                self.request_kill(child)?;
            }

            let status = match waitid(Id::All, WaitPidFlag::WEXITED | WaitPidFlag::WSTOPPED | WaitPidFlag::WNOWAIT) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    return Err(EngineError::protocol("all tracees gone without a terminal event for the primary child"))
                }
                Err(errno) => return Err(EngineError::system("waitid", errno)),
            };

            let pid = status.pid().ok_or_else(|| EngineError::protocol("wait status carried no pid"))?;

            match status {
                WaitStatus::Exited(p, code) if p == child => {
                    let _ = waitpid(p, None);
                    let event = ExecuteEvent::exited(p, code);
                    self.finish(event, tracer, action);
                    return Ok(event);
                }
                WaitStatus::Signaled(p, sig, _) if p == child => {
                    let _ = waitpid(p, None);
                    let event = ExecuteEvent::killed(p, sig as i32);
                    self.finish(event, tracer, action);
                    return Ok(event);
                }
                WaitStatus::Exited(p, _) | WaitStatus::Signaled(p, _, _) => {
                    let _ = waitpid(p, None);
                    tracer.forget(p);
                }
                other => {
                    if tracer.is_tracking(pid) {
                        if let Some(event) = non_terminal_execute_event(pid, &other) {
                            action = self.listeners.on_execute_event(&event, action);
                        }
                        tracer.handle_stop(pid, &other, &mut self.listeners)?;
                    }
                }
            }

            if action == ExecuteAction::Kill {
                self.request_kill(child)?;
            }
        }
    }

    fn finish(&mut self, event: ExecuteEvent, _tracer: &mut Tracer, seed: ExecuteAction) {
        let _ = self.listeners.on_execute_event(&event, seed);
        self.output.set_exit_status(event.recorded_exit_status());
        if event.killed {
            self.output.set_kill_signal(event.signal);
        }
    }

    /// Sends `SIGKILL` to the child. Records the kill signal on the
    /// output immediately (matching `Executor.cc::killChild`'s
    /// unconditional `setKillSignal(SIGKILL)`), before the wait loop has
    /// even observed the death. `ESRCH` (already dead) is not an error.
    fn request_kill(&mut self, child: Pid) -> Result<()> {
        self.output.set_kill_signal(Signal::SIGKILL as i32);
        match signal::kill(child, Signal::SIGKILL) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(EngineError::system("kill child", errno)),
        }
    }
}

/// Classifies a non-terminal ptrace-related wait status into the
/// `ExecuteEvent` it represents, so every stop -- not just the primary
/// child's eventual exit or kill -- reaches `on_execute_event`. Plain
/// signal-delivery group-stops map to `stopped`; ptrace-trap stops
/// (syscall-stops, seccomp, clone/fork/exec/exit events) map to `trapped`.
fn non_terminal_execute_event(pid: Pid, status: &WaitStatus) -> Option<ExecuteEvent> {
    match status {
        WaitStatus::Stopped(_, signal) => Some(ExecuteEvent::stopped(pid, *signal as i32)),
        WaitStatus::PtraceEvent(_, signal, _) => Some(ExecuteEvent::trapped(pid, *signal as i32)),
        WaitStatus::PtraceSyscall(_) => Some(ExecuteEvent::trapped(pid, 0)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::BasicOutputSink;

    #[test]
    fn builder_accepts_listeners_and_policy() {
        let policy = crate::seccomp::Policy::allow(crate::tracee::Arch::X86_64).compile().unwrap();
        let executor = Executor::new(
            CString::new("/bin/true").unwrap(),
            vec![CString::new("true").unwrap()],
            vec![],
            Box::<BasicOutputSink>::default(),
        )
        .with_listener(Box::new(crate::listener::LoggerListener))
        .with_seccomp_policy(policy);
        assert!(executor.policy.is_some());
    }

    #[test]
    fn non_terminal_execute_event_classifies_signal_delivery_as_stopped() {
        let pid = Pid::from_raw(1);
        let event = non_terminal_execute_event(pid, &WaitStatus::Stopped(pid, Signal::SIGSTOP)).unwrap();
        assert!(event.stopped);
        assert!(!event.trapped);
    }

    #[test]
    fn non_terminal_execute_event_classifies_ptrace_stops_as_trapped() {
        let pid = Pid::from_raw(1);
        assert!(non_terminal_execute_event(pid, &WaitStatus::PtraceSyscall(pid)).unwrap().trapped);
        assert!(non_terminal_execute_event(pid, &WaitStatus::PtraceEvent(pid, Signal::SIGTRAP, 0)).unwrap().trapped);
    }
}
