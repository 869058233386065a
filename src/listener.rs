//! The extension point: listeners subscribe to executor and tracer
//! lifecycle hooks, registered in insertion order, dispatched in that same
//! order every time. Missing hooks default to the minimum action (not a
//! vtable lookup failure -- modeled as a capability record via default
//! trait methods, not inheritance).

use nix::unistd::Pid;
use tracing::debug;

use crate::error::Result;
use crate::event::{ExecuteAction, ExecuteEvent, TraceAction, TraceEvent};
use crate::tracee::Tracee;

#[allow(unused_variables)]
pub trait Listener {
    fn on_pre_fork(&mut self) -> Result<()> {
        Ok(())
    }

    fn on_post_fork_child(&mut self) {}

    fn on_post_fork_parent(&mut self, child_pid: Pid) {}

    fn on_execute_event(&mut self, event: &ExecuteEvent) -> ExecuteAction {
        ExecuteAction::default()
    }

    fn on_sigio_signal(&mut self) -> ExecuteAction {
        ExecuteAction::default()
    }

    fn on_sigalrm_signal(&mut self) -> ExecuteAction {
        ExecuteAction::default()
    }

    fn on_post_exec(&mut self, event: &TraceEvent, tracee: &mut Tracee) -> TraceAction {
        TraceAction::default()
    }

    fn on_post_clone(&mut self, parent_pid: Pid, child_pid: Pid) -> TraceAction {
        TraceAction::default()
    }

    fn on_trace_event(&mut self, event: &TraceEvent, tracee: &mut Tracee) -> TraceAction {
        TraceAction::default()
    }

    fn on_post_execute(&mut self) {}
}

/// Owns the registered listeners and folds their verdicts with `max`.
#[derive(Default)]
pub struct ListenerBus {
    listeners: Vec<Box<dyn Listener>>,
}

impl ListenerBus {
    pub fn new() -> Self {
        ListenerBus { listeners: Vec::new() }
    }

    pub fn register(&mut self, listener: Box<dyn Listener>) {
        self.listeners.push(listener);
    }

    pub fn on_pre_fork(&mut self) -> Result<()> {
        for listener in &mut self.listeners {
            listener.on_pre_fork()?;
        }
        Ok(())
    }

    pub fn on_post_fork_child(&mut self) {
        for listener in &mut self.listeners {
            listener.on_post_fork_child();
        }
    }

    pub fn on_post_fork_parent(&mut self, child_pid: Pid) {
        for listener in &mut self.listeners {
            listener.on_post_fork_parent(child_pid);
        }
    }

    pub fn on_execute_event(&mut self, event: &ExecuteEvent, seed: ExecuteAction) -> ExecuteAction {
        let mut action = seed;
        for listener in &mut self.listeners {
            action = action.max(listener.on_execute_event(event));
        }
        action
    }

    pub fn on_sigio_signal(&mut self, seed: ExecuteAction) -> ExecuteAction {
        let mut action = seed;
        for listener in &mut self.listeners {
            action = action.max(listener.on_sigio_signal());
        }
        action
    }

    pub fn on_sigalrm_signal(&mut self, seed: ExecuteAction) -> ExecuteAction {
        let mut action = seed;
        for listener in &mut self.listeners {
            action = action.max(listener.on_sigalrm_signal());
        }
        action
    }

    pub fn on_post_exec(&mut self, event: &TraceEvent, tracee: &mut Tracee) -> TraceAction {
        let mut action = TraceAction::default();
        for listener in &mut self.listeners {
            action = action.max(listener.on_post_exec(event, tracee));
        }
        action
    }

    pub fn on_post_clone(&mut self, parent_pid: Pid, child_pid: Pid) -> TraceAction {
        let mut action = TraceAction::default();
        for listener in &mut self.listeners {
            action = action.max(listener.on_post_clone(parent_pid, child_pid));
        }
        action
    }

    pub fn on_trace_event(&mut self, event: &TraceEvent, tracee: &mut Tracee) -> TraceAction {
        let mut action = TraceAction::default();
        for listener in &mut self.listeners {
            action = action.max(listener.on_trace_event(event, tracee));
        }
        action
    }

    pub fn on_post_execute(&mut self) {
        for listener in &mut self.listeners {
            listener.on_post_execute();
        }
    }
}

/// Logs every lifecycle hook at debug level. Direct port of
/// `LoggerListener.cc`'s call sites; ships as the reference listener
/// implementation since the Listener Bus itself is in scope even though
/// the metering listeners it was designed to carry are not.
#[derive(Default)]
pub struct LoggerListener;

impl Listener for LoggerListener {
    fn on_pre_fork(&mut self) -> Result<()> {
        debug!("execution stage: on_pre_fork");
        Ok(())
    }

    fn on_post_fork_child(&mut self) {
        debug!("execution stage: on_post_fork_child");
    }

    fn on_post_fork_parent(&mut self, child_pid: Pid) {
        debug!(%child_pid, "execution stage: on_post_fork_parent");
    }

    fn on_execute_event(&mut self, event: &ExecuteEvent) -> ExecuteAction {
        debug!(
            pid = %event.pid,
            exit_status = event.exit_status,
            signal = event.signal,
            exited = event.exited,
            killed = event.killed,
            stopped = event.stopped,
            trapped = event.trapped,
            "execution stage: on_execute_event"
        );
        ExecuteAction::default()
    }

    fn on_post_exec(&mut self, _event: &TraceEvent, _tracee: &mut Tracee) -> TraceAction {
        debug!("execution stage: on_post_exec");
        TraceAction::default()
    }

    fn on_post_clone(&mut self, parent_pid: Pid, child_pid: Pid) -> TraceAction {
        debug!(%parent_pid, %child_pid, "execution stage: on_post_clone");
        TraceAction::default()
    }

    fn on_trace_event(&mut self, _event: &TraceEvent, tracee: &mut Tracee) -> TraceAction {
        debug!(alive = tracee.is_alive(), "execution stage: on_trace_event");
        TraceAction::default()
    }

    fn on_post_execute(&mut self) {
        debug!("execution stage: on_post_execute");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysKill;
    impl Listener for AlwaysKill {
        fn on_execute_event(&mut self, _event: &ExecuteEvent) -> ExecuteAction {
            ExecuteAction::Kill
        }
    }

    #[derive(Default)]
    struct NeverKill;
    impl Listener for NeverKill {}

    #[test]
    fn aggregation_is_max_regardless_of_registration_order() {
        let event = ExecuteEvent::exited(Pid::from_raw(1), 0);

        let mut bus_a = ListenerBus::new();
        bus_a.register(Box::new(NeverKill));
        bus_a.register(Box::new(AlwaysKill));

        let mut bus_b = ListenerBus::new();
        bus_b.register(Box::new(AlwaysKill));
        bus_b.register(Box::new(NeverKill));

        assert_eq!(bus_a.on_execute_event(&event, ExecuteAction::default()), ExecuteAction::Kill);
        assert_eq!(bus_b.on_execute_event(&event, ExecuteAction::default()), ExecuteAction::Kill);
    }

    #[test]
    fn missing_hooks_default_to_minimum_action() {
        let mut bus = ListenerBus::new();
        bus.register(Box::new(NeverKill));
        let event = ExecuteEvent::exited(Pid::from_raw(1), 0);
        assert_eq!(bus.on_execute_event(&event, ExecuteAction::default()), ExecuteAction::Continue);
    }
}
