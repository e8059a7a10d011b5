//! 4.D Unmount Service: a bounded ladder of unmount commands executed under
//! a single total deadline, with leaked-helper detection and killing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{
    TOTAL_UNMOUNT_TIMEOUT, UNMOUNT_MIN_REMAINING_TO_START, UNMOUNT_ROUND_MAX, UNMOUNT_STEP_CLAMP,
};
use crate::error::{Blocker, CoreError};
use crate::mount_table::MountTableInspector;
use crate::process::ProcessExecutor;

const DISKUTIL_PATH: &str = "/usr/sbin/diskutil";
const UMOUNT_PATH: &str = "/sbin/umount";
const PS_PATH: &str = "/bin/ps";
const KILL_PATH: &str = "/bin/kill";
const LSOF_PATH: &str = "/usr/sbin/lsof";

struct LadderStep {
    executable: &'static str,
    args_for: fn(&str) -> Vec<String>,
}

const LADDER: [LadderStep; 4] = [
    LadderStep { executable: DISKUTIL_PATH, args_for: |p| vec!["unmount".into(), p.into()] },
    LadderStep { executable: UMOUNT_PATH, args_for: |p| vec![p.into()] },
    LadderStep { executable: DISKUTIL_PATH, args_for: |p| vec!["unmount".into(), "force".into(), p.into()] },
    LadderStep { executable: UMOUNT_PATH, args_for: |p| vec!["-f".into(), p.into()] },
];

pub struct UnmountService {
    executor: Arc<dyn ProcessExecutor>,
    inspector: Arc<MountTableInspector>,
}

impl UnmountService {
    pub fn new(executor: Arc<dyn ProcessExecutor>, inspector: Arc<MountTableInspector>) -> Self {
        Self { executor, inspector }
    }

    pub async fn unmount(&self, normalized_path: &str, source_needle: &str) -> Result<(), CoreError> {
        let deadline = Instant::now() + TOTAL_UNMOUNT_TIMEOUT;

        if self.inspector.find(normalized_path).await?.is_none() {
            return Ok(());
        }

        let mut saw_busy = false;
        for round in 1..=UNMOUNT_ROUND_MAX {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining < UNMOUNT_MIN_REMAINING_TO_START {
                break;
            }
            let step = &LADDER[(round - 1) as usize];
            let step_timeout = remaining.min(UNMOUNT_STEP_CLAMP);
            let args = (step.args_for)(normalized_path);
            let out = self.executor.run(step.executable, &args, &[], step_timeout, None, None).await?;

            if out.success() && self.inspector.find(normalized_path).await?.is_none() {
                return Ok(());
            }

            let combined = out.combined().to_ascii_lowercase();
            if combined.contains("busy") || combined.contains("resource busy") {
                saw_busy = true;
            }

            if saw_busy {
                let blockers = self.scan_blockers(normalized_path).await?;
                let non_sshfs: Vec<Blocker> = blockers.into_iter().filter(|b| !b.command.to_ascii_lowercase().contains("sshfs")).collect();
                if !non_sshfs.is_empty() {
                    return Err(CoreError::Busy(non_sshfs));
                }
            }

            if round == 1 {
                self.signal_helpers(normalized_path, source_needle, "-TERM").await?;
            } else if round == 2 {
                self.signal_helpers(normalized_path, source_needle, "-KILL").await?;
            }

            if self.inspector.find(normalized_path).await?.is_none() {
                return Ok(());
            }
        }

        if self.inspector.find(normalized_path).await?.is_none() {
            Ok(())
        } else if Instant::now() >= deadline {
            Err(CoreError::timeout(format!("unmount of {normalized_path} did not complete within deadline")))
        } else {
            Err(CoreError::process_failure(None, format!("mount {normalized_path} still present after ladder")))
        }
    }

    async fn scan_blockers(&self, normalized_path: &str) -> Result<Vec<Blocker>, CoreError> {
        let args = vec!["-n".into(), "-w".into(), "-Fpcn".into(), "+D".into(), normalized_path.into()];
        let out = self.executor.run(LSOF_PATH, &args, &[], Duration::from_secs(3), None, None).await?;
        Ok(parse_lsof_fields(&out.stdout))
    }

    async fn signal_helpers(&self, normalized_path: &str, source_needle: &str, signal: &str) -> Result<(), CoreError> {
        let out = self
            .executor
            .run(PS_PATH, &["-axo".into(), "pid=,command=".into()], &[], Duration::from_secs(3), None, None)
            .await?;
        let pids = matching_sshfs_pids(&out.stdout, normalized_path, source_needle);
        for pid in pids {
            let _ = self.executor.run(KILL_PATH, &[signal.to_string(), pid.to_string()], &[], Duration::from_secs(2), None, None).await;
        }
        Ok(())
    }
}

/// Parse `ps -axo pid=,command=` output and return pids of processes whose
/// command line mentions `sshfs` and either the mount path or the source
/// needle. Never returns pid <= 1.
pub fn matching_sshfs_pids(ps_output: &str, mount_path: &str, source_needle: &str) -> Vec<i32> {
    ps_output
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid_str, command) = line.split_once(char::is_whitespace)?;
            let pid: i32 = pid_str.trim().parse().ok()?;
            if pid <= 1 {
                return None;
            }
            let lower = command.to_ascii_lowercase();
            if !lower.contains("sshfs") {
                return None;
            }
            if command.contains(mount_path) || command.contains(source_needle) {
                Some(pid)
            } else {
                None
            }
        })
        .collect()
}

/// Parse `lsof -Fpcn` field output (`p<pid>`, `c<command>`, `n<name>`
/// lines, one process block per `p` line) into blockers.
fn parse_lsof_fields(output: &str) -> Vec<Blocker> {
    let mut blockers = Vec::new();
    let mut pid: Option<i32> = None;
    let mut command: Option<String> = None;
    for line in output.lines() {
        if let Some(rest) = line.strip_prefix('p') {
            if let (Some(p), Some(c)) = (pid.take(), command.take()) {
                blockers.push(Blocker { pid: p, command: c });
            }
            pid = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix('c') {
            command = Some(rest.trim().to_string());
        }
    }
    if let (Some(p), Some(c)) = (pid, command) {
        blockers.push(Blocker { pid: p, command: c });
    }
    blockers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_sshfs_pid_by_mount_path() {
        let ps = " 123 sshfs -o reconnect user@host:/srv /Users/a/mnt/box\n\
                     456 Finder\n\
                     1 launchd\n";
        let pids = matching_sshfs_pids(ps, "/Users/a/mnt/box", "user@host:/srv");
        assert_eq!(pids, vec![123]);
    }

    #[test]
    fn never_matches_pid_one_or_below() {
        let ps = " 1 sshfs user@host:/srv /mnt\n 0 sshfs user@host:/srv /mnt\n";
        assert!(matching_sshfs_pids(ps, "/mnt", "user@host:/srv").is_empty());
    }

    #[test]
    fn parses_lsof_field_output_into_blockers() {
        let out = "p412\ncFinder\nn/mnt/x\np980\ncbash\nn/mnt/x/sub\n";
        let blockers = parse_lsof_fields(out);
        assert_eq!(blockers, vec![
            Blocker { pid: 412, command: "Finder".into() },
            Blocker { pid: 980, command: "bash".into() },
        ]);
    }
}
