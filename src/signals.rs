//! `SIGIO`/`SIGALRM` latching, drained by the parent's wait loop.
//!
//! Only an atomic one-bit flag may be touched from the handler; all other
//! work happens in `drain`, which runs at a safe point between wait calls.
//! Mirrors `Executor.cc`'s `sigioOccurred`/`sigalrmOccurred` volatiles, but
//! as process-wide state with explicit init/teardown instead of a
//! statically-constructed singleton, so a process that runs the engine
//! more than once doesn't double-initialize signal handlers.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{self, SigAction, SigHandler, Signal};

use crate::error::{EngineError, Result};

static SIGIO_FLAG: AtomicBool = AtomicBool::new(false);
static SIGALRM_FLAG: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigio(_: libc::c_int) {
    SIGIO_FLAG.store(true, Ordering::Relaxed);
}

extern "C" fn handle_sigalrm(_: libc::c_int) {
    SIGALRM_FLAG.store(true, Ordering::Relaxed);
}

/// A single drain of the two latched signal flags. `sigio`/`sigalrm` are
/// true iff the corresponding signal arrived since the last drain.
#[derive(Debug, Clone, Copy, Default)]
pub struct DrainedSignals {
    pub sigio: bool,
    pub sigalrm: bool,
}

/// Installs handlers for `SIGIO` and `SIGALRM` that block all other signals
/// while running (matching `sigfillset` + `sigaction` in the source). Must
/// be called once per run, before the wait loop starts.
pub fn install() -> Result<()> {
    SIGIO_FLAG.store(false, Ordering::Relaxed);
    SIGALRM_FLAG.store(false, Ordering::Relaxed);

    let mut mask = signal::SigSet::empty();
    mask.fill();

    let sigio_action = SigAction::new(SigHandler::Handler(handle_sigio), signal::SaFlags::empty(), mask);
    let sigalrm_action = SigAction::new(SigHandler::Handler(handle_sigalrm), signal::SaFlags::empty(), mask);

    unsafe {
        signal::sigaction(Signal::SIGIO, &sigio_action)
            .map_err(|errno| EngineError::system("sigaction(SIGIO)", errno))?;
        signal::sigaction(Signal::SIGALRM, &sigalrm_action)
            .map_err(|errno| EngineError::system("sigaction(SIGALRM)", errno))?;
    }
    Ok(())
}

/// Restores the default disposition for both signals. Called after the run
/// completes so global state doesn't leak into a second `execute()` in the
/// same process.
pub fn teardown() -> Result<()> {
    unsafe {
        signal::sigaction(
            Signal::SIGIO,
            &SigAction::new(SigHandler::SigDfl, signal::SaFlags::empty(), signal::SigSet::empty()),
        )
        .map_err(|errno| EngineError::system("sigaction(SIGIO) restore", errno))?;
        signal::sigaction(
            Signal::SIGALRM,
            &SigAction::new(SigHandler::SigDfl, signal::SaFlags::empty(), signal::SigSet::empty()),
        )
        .map_err(|errno| EngineError::system("sigaction(SIGALRM) restore", errno))?;
    }
    Ok(())
}

/// Atomically reads and clears both flags. There's an inherent race
/// between this read and the following `waitid`: a signal can land in the
/// gap. That's why the wait is always retried on `EINTR` -- the next loop
/// iteration's drain picks up anything missed, so no flag is lost for more
/// than one iteration.
pub fn drain() -> DrainedSignals {
    DrainedSignals {
        sigio: SIGIO_FLAG.swap(false, Ordering::Relaxed),
        sigalrm: SIGALRM_FLAG.swap(false, Ordering::Relaxed),
    }
}
