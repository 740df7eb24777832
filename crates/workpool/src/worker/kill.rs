//! Process kill modes and signal delivery

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PoolError;

/// Signal sent when none is configured (SIGKILL)
pub const DEFAULT_KILL_SIGNAL: i32 = 9;

/// How a process worker's child is terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KillMode {
    /// Signal the child only
    #[default]
    #[serde(rename = "kill")]
    Kill,
    /// Signal the child's whole process group, then fall back to `Kill`
    ///
    /// Only the group the child leads is reached. A descendant that calls
    /// `setsid` or `setpgid` has left it and survives the kill.
    #[serde(rename = "treeKill")]
    TreeKill,
}

impl KillMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            KillMode::Kill => "kill",
            KillMode::TreeKill => "treeKill",
        }
    }
}

impl std::fmt::Display for KillMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KillMode {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kill" => Ok(KillMode::Kill),
            "treeKill" => Ok(KillMode::TreeKill),
            other => Err(PoolError::UnknownKillMode(other.to_string())),
        }
    }
}

/// Signal 0 only checks that the process exists
#[cfg(unix)]
fn to_signal(signal: i32) -> std::io::Result<Option<nix::sys::signal::Signal>> {
    if signal == 0 {
        return Ok(None);
    }
    Ok(Some(nix::sys::signal::Signal::try_from(signal)?))
}

/// Send a signal to one process
///
/// Returns false when the process no longer exists.
#[cfg(unix)]
pub(crate) fn signal_process(pid: u32, signal: i32) -> std::io::Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let signal = to_signal(signal)?;
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(errno) => Err(errno.into()),
    }
}

/// Send a signal to every process in the group led by `pid`
///
/// Returns false when the group no longer exists. Processes that moved to
/// another group or session are not signaled.
#[cfg(unix)]
pub(crate) fn signal_group(pid: u32, signal: i32) -> std::io::Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let signal = to_signal(signal)?;
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(errno) => Err(errno.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kill_modes() {
        assert_eq!("kill".parse::<KillMode>().unwrap(), KillMode::Kill);
        assert_eq!("treeKill".parse::<KillMode>().unwrap(), KillMode::TreeKill);
    }

    #[test]
    fn test_unknown_kill_mode() {
        let err = "tree-kill".parse::<KillMode>().unwrap_err();
        assert!(matches!(err, PoolError::UnknownKillMode(ref mode) if mode == "tree-kill"));
        assert_eq!(err.to_string(), "unknown kill mode: tree-kill");
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&KillMode::TreeKill).unwrap(), "\"treeKill\"");
        let parsed: KillMode = serde_json::from_str("\"kill\"").unwrap();
        assert_eq!(parsed, KillMode::Kill);
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_missing_process() {
        // Pid space rarely reaches this high; a missing pid reports false.
        assert!(!signal_process(i32::MAX as u32 - 1, 0).unwrap());
    }

    /// Start `sh -c script` as a group leader and read the pid it prints
    #[cfg(unix)]
    fn spawn_leader(script: &str) -> (std::process::Child, u32) {
        use std::io::{BufRead, BufReader};
        use std::os::unix::process::CommandExt;
        use std::process::{Command, Stdio};

        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .stdout(Stdio::piped())
            .process_group(0)
            .spawn()
            .unwrap();
        let mut line = String::new();
        BufReader::new(child.stdout.take().unwrap())
            .read_line(&mut line)
            .unwrap();
        (child, line.trim().parse().unwrap())
    }

    /// Exists and is not a zombie waiting for a reaper
    #[cfg(unix)]
    fn running(pid: u32) -> bool {
        if !signal_process(pid, 0).unwrap() {
            return false;
        }
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map_or(true, |rest| rest.trim_start().chars().next() != Some('Z')),
            Err(_) => true,
        }
    }

    #[cfg(unix)]
    fn gone_within(pid: u32, attempts: u32) -> bool {
        for _ in 0..attempts {
            if !running(pid) {
                return true;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        false
    }

    #[cfg(unix)]
    #[test]
    fn test_group_signal_reaches_descendants() {
        let (mut leader, descendant) = spawn_leader("sleep 30 & echo $!; wait");

        assert!(signal_group(leader.id(), DEFAULT_KILL_SIGNAL).unwrap());
        leader.wait().unwrap();
        assert!(gone_within(descendant, 200));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_detached_descendant_escapes_group_signal() {
        let (mut leader, detached) = spawn_leader("setsid sleep 30 & echo $!; wait");
        std::thread::sleep(std::time::Duration::from_millis(50));

        assert!(signal_group(leader.id(), DEFAULT_KILL_SIGNAL).unwrap());
        leader.wait().unwrap();
        assert!(!gone_within(detached, 20));

        signal_process(detached, DEFAULT_KILL_SIGNAL).unwrap();
        assert!(gone_within(detached, 200));
    }
}
