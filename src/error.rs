use nix::errno::Errno;
use thiserror::Error;

/// The engine's error taxonomy: a kernel primitive failing, a ptrace-stop
/// the tracer can't classify, or a malformed policy discovered before
/// fork. Policy violations by the traced program are not an `EngineError`
/// at all -- they flow out through the normal `ExecuteEvent`/verdict path.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A kernel primitive returned an error. Fatal unless the call site
    /// explicitly whitelists the errno (e.g. `ESRCH` on a kill of an
    /// already-dead child).
    #[error("{operation} failed: {errno}")]
    SystemFailure { operation: &'static str, errno: Errno },

    /// The tracer observed a ptrace-stop it can't classify, or a tracee's
    /// register/architecture state is inconsistent with what's expected.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Malformed policy, a syscall rule naming an architecture the filter
    /// compiler can't validate, or a missing kernel feature. Always
    /// surfaced before fork.
    #[error("configuration error: {0}")]
    ConfigError(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn system(operation: &'static str, errno: Errno) -> Self {
        EngineError::SystemFailure { operation, errno }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        EngineError::ProtocolError(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        EngineError::ConfigError(message.into())
    }
}

/// Runs a nix syscall wrapper, turning any error other than one of the
/// whitelisted errnos into a fatal `SystemFailure`. Mirrors
/// `withErrnoCheck` from the source implementation, minus the whitelist
/// (callers that need to tolerate e.g. `ESRCH` match on the error
/// themselves; see `Executor::kill_child`).
pub fn check(operation: &'static str, result: nix::Result<()>) -> Result<()> {
    result.map_err(|errno| EngineError::system(operation, errno))
}
