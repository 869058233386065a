//! Kernel feature check, grounded on `Utils.h::checkKernelVersion`: refuse
//! to start rather than fail deep inside the ptrace/seccomp machinery on a
//! kernel too old to support the features the engine relies on
//! (`PTRACE_O_TRACESECCOMP` needs 3.5, `process_vm_readv` needs 3.2; the
//! conservative floor below covers both with headroom).

use nix::sys::utsname::uname;

use crate::error::{EngineError, Result};

/// Parses the leading `major.minor` out of a kernel release string such as
/// `"6.8.0-40-generic"`, ignoring anything after the second dot.
fn parse_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor_str = parts.next()?;
    let minor_digits: String = minor_str.chars().take_while(|c| c.is_ascii_digit()).collect();
    let minor = minor_digits.parse().ok()?;
    Some((major, minor))
}

/// Confirms the running kernel is at least `minimum`. Called once before
/// the first fork.
pub fn check_kernel_version(minimum: (u32, u32)) -> Result<()> {
    let info = uname().map_err(|errno| EngineError::system("uname", errno))?;
    let release = info.release().to_string_lossy();
    let (major, minor) =
        parse_release(&release).ok_or_else(|| EngineError::config(format!("unparseable kernel release {release:?}")))?;

    if (major, minor) < minimum {
        return Err(EngineError::config(format!(
            "kernel {major}.{minor} is older than the minimum required {}.{}",
            minimum.0, minimum.1
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_release_string() {
        assert_eq!(parse_release("5.15.0"), Some((5, 15)));
    }

    #[test]
    fn parses_distro_suffixed_release_string() {
        assert_eq!(parse_release("6.8.0-40-generic"), Some((6, 8)));
    }

    #[test]
    fn rejects_unparseable_release_string() {
        assert_eq!(parse_release("not-a-version"), None);
    }

    #[test]
    fn current_kernel_satisfies_the_floor() {
        // Any kernel capable of running this test suite is well past the
        // engine's 3.19 floor.
        check_kernel_version((3, 19)).expect("host kernel should be new enough");
    }
}
