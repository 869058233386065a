//! End-to-end scenarios against real system binaries, covering the
//! concrete cases the supervision engine is meant to handle: clean exit,
//! fatal signal, a seccomp kill with nothing allow-listed, a seccomp
//! trace-and-cancel that forces a permission denial, a wall-clock
//! timeout, and a tracee that forks a grandchild.

use std::cell::Cell;
use std::ffi::CString;
use std::rc::Rc;

use judgebox::{
    Action, Arch, BasicOutputSink, Executor, Listener, Matcher, Policy, Rule, Tracee, TraceAction, TraceEvent,
    TraceEventKind, TraceHandler,
};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use syscalls::Sysno;

fn run(program: &str, args: &[&str]) -> judgebox::ExecuteEvent {
    run_with(program, args, None, vec![])
}

fn run_with(
    program: &str,
    args: &[&str],
    policy: Option<Policy>,
    listeners: Vec<Box<dyn Listener>>,
) -> judgebox::ExecuteEvent {
    run_full(program, args, policy, listeners, vec![])
}

fn run_full(
    program: &str,
    args: &[&str],
    policy: Option<Policy>,
    listeners: Vec<Box<dyn Listener>>,
    trace_handlers: Vec<(u32, Box<dyn TraceHandler>)>,
) -> judgebox::ExecuteEvent {
    let argv = std::iter::once(CString::new(program).unwrap())
        .chain(args.iter().map(|a| CString::new(*a).unwrap()))
        .collect();
    let env = std::env::vars()
        .map(|(k, v)| CString::new(format!("{k}={v}")).unwrap())
        .collect();

    let mut executor = Executor::new(CString::new(program).unwrap(), argv, env, Box::<BasicOutputSink>::default());
    for listener in listeners {
        executor = executor.with_listener(listener);
    }
    for (code, handler) in trace_handlers {
        executor = executor.with_trace_handler(code, handler);
    }
    if let Some(policy) = policy {
        executor = executor.with_seccomp_policy(policy.compile().expect("policy should compile"));
    }
    executor.execute().expect("execute should not hit a system failure")
}

#[test]
fn clean_exit_reports_zero() {
    let event = run("/bin/true", &[]);
    assert!(event.exited);
    assert_eq!(event.exit_status, 0);
    assert_eq!(event.recorded_exit_status(), 0);
}

#[test]
fn fatal_signal_reports_128_plus_signal() {
    let event = run("/bin/sh", &["-c", "kill -SEGV $$"]);
    assert!(event.killed);
    assert_eq!(event.signal, Signal::SIGSEGV as i32);
    assert_eq!(event.recorded_exit_status(), 139);
}

#[test]
fn seccomp_kill_with_nothing_allowed_kills_before_the_target_ever_runs() {
    // Default KILL, no rules at all: even the `execve` the child is about
    // to issue to become `/bin/true` is denied, so the process dies by
    // the seccomp kill signal regardless of what the target would do.
    let policy = Policy::new(Arch::X86_64, Action::Kill);
    let event = run_with("/bin/true", &[], Some(policy), vec![]);
    assert!(event.killed);
    assert_eq!(event.signal, Signal::SIGSYS as i32);
}

/// Cancels `open`/`openat` on one specific path, forcing `EACCES` as if
/// permission had been denied, and lets every other syscall (including
/// the dynamic linker's own library opens) through untouched. Bound to
/// trace code `1` via the side table, so it's only ever invoked for the
/// exact seccomp stop it was registered for -- no re-filtering needed.
struct CancelOpenHandler {
    target: Vec<u8>,
}

impl TraceHandler for CancelOpenHandler {
    fn handle(&mut self, _event: &TraceEvent, tracee: &mut Tracee) -> TraceAction {
        let Ok(number) = tracee.get_syscall_number() else {
            return TraceAction::default();
        };
        let path_arg = if number == Sysno::open as i64 {
            0
        } else if number == Sysno::openat as i64 {
            1
        } else {
            return TraceAction::default();
        };
        let Ok(addr) = tracee.get_syscall_argument(path_arg) else {
            return TraceAction::default();
        };
        if let Ok(path) = tracee.read_memory_string(addr, 256) {
            if path == self.target {
                let _ = tracee.cancel_syscall(-(libc::EACCES as i64));
            }
        }
        TraceAction::Continue
    }
}

#[test]
fn seccomp_trace_and_cancel_forces_permission_denied_on_one_path() {
    let mut policy = Policy::new(Arch::X86_64, Action::Allow);
    policy.push(Rule::new(Matcher::Syscall(Sysno::open), Action::Trace(1)));
    policy.push(Rule::new(Matcher::Syscall(Sysno::openat), Action::Trace(1)));

    let handler = CancelOpenHandler { target: b"/etc/hostname".to_vec() };
    let event = run_full(
        "/bin/sh",
        &["-c", "cat /etc/hostname >/dev/null"],
        Some(policy),
        vec![],
        vec![(1, Box::new(handler))],
    );

    assert!(event.exited);
    assert_eq!(event.exit_status, 1);
}

/// Fires `SIGALRM` at the supervisor one second after the child starts;
/// the listener turns that into a `Kill` verdict, matching the timeout
/// path a wall-clock-limit listener would implement.
struct AlarmTimeoutListener;

impl Listener for AlarmTimeoutListener {
    fn on_post_fork_parent(&mut self, _child_pid: Pid) {
        unsafe {
            libc::alarm(1);
        }
    }

    fn on_sigalrm_signal(&mut self) -> judgebox::ExecuteAction {
        judgebox::ExecuteAction::Kill
    }
}

#[test]
fn timeout_listener_kills_a_busy_loop() {
    let event = run_with("/bin/sh", &["-c", "while :; do :; done"], None, vec![Box::new(AlarmTimeoutListener)]);
    assert!(event.killed);
    assert_eq!(event.signal, Signal::SIGKILL as i32);
}

/// Counts every `Exit`-kind trace event it sees, across every tracee, not
/// just the original child.
struct ExitCounter(Rc<Cell<u32>>);

impl Listener for ExitCounter {
    fn on_trace_event(&mut self, event: &TraceEvent, _tracee: &mut Tracee) -> TraceAction {
        if event.kind == TraceEventKind::Exit {
            self.0.set(self.0.get() + 1);
        }
        TraceAction::default()
    }
}

#[test]
fn fork_beneath_tracer_observes_both_the_grandchild_and_the_child() {
    let count = Rc::new(Cell::new(0));
    let event = run_with(
        "/bin/sh",
        &["-c", "(echo grandchild >/dev/null) & wait"],
        None,
        vec![Box::new(ExitCounter(count.clone()))],
    );

    assert!(event.exited);
    assert_eq!(event.exit_status, 0);
    assert!(count.get() >= 2, "expected at least the grandchild's and the child's own exit, saw {}", count.get());
}
