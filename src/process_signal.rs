//! Process-group signaling for worker teardown.

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;

/// Signal a worker's whole process group, falling back to the pid itself.
///
/// Workers are spawned as group leaders, so signaling the group reaches any
/// children they started. A target that no longer exists counts as success.
pub fn signal_group(pid: u32, signal: Signal) -> nix::Result<()> {
    let raw = match i32::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => return Ok(()),
    };

    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) => Ok(()),
        Err(_) => match kill(Pid::from_raw(raw), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e),
        },
    }
}

/// True while any process in the group is still alive.
pub fn group_alive(pid: u32) -> bool {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => killpg(Pid::from_raw(raw), None::<Signal>).is_ok(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_positive_pid_is_ignored() {
        assert!(signal_group(0, Signal::SIGTERM).is_ok());
        assert!(!group_alive(0));
    }

    #[test]
    fn missing_target_is_not_an_error() {
        // Beyond the default pid_max, so never allocated.
        let missing = i32::MAX as u32;
        assert!(signal_group(missing, Signal::SIGKILL).is_ok());
        assert!(!group_alive(missing));
    }
}
