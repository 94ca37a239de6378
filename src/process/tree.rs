//! Recursive process-tree termination.
//!
//! The walk is platform independent: take a snapshot of `(pid, ppid)` pairs,
//! order the tree rooted at the app children-first, and kill each node. Only
//! the snapshot and the kill primitive differ per platform.

use tracing::debug;

use super::LaunchError;

/// `(pid, parent pid)` for every process visible to us.
pub type ProcessTable = Vec<(u32, u32)>;

/// Kill `pid` and all of its descendants, deepest first.
///
/// Fails if `pid` does not exist. Descendants that exit on their own while
/// the walk is running are not an error.
pub fn kill_process_tree(pid: u32) -> Result<(), LaunchError> {
    let table = platform::process_table()?;
    if !table.iter().any(|&(p, _)| p == pid) {
        return Err(LaunchError::NoSuchProcess(pid));
    }
    for victim in kill_order(pid, &table) {
        debug!(pid = victim, "killing process");
        platform::kill(victim)?;
    }
    platform::kill_group(pid);
    Ok(())
}

/// Direct children of `pid` in `table`.
pub fn child_pids(pid: u32, table: &[(u32, u32)]) -> Vec<u32> {
    table
        .iter()
        .filter(|&&(child, parent)| parent == pid && child != pid)
        .map(|&(child, _)| child)
        .collect()
}

/// Post-order walk of the tree rooted at `root`: every process appears after
/// all of its descendants.
pub fn kill_order(root: u32, table: &[(u32, u32)]) -> Vec<u32> {
    fn visit(pid: u32, table: &[(u32, u32)], out: &mut Vec<u32>) {
        if out.contains(&pid) {
            return;
        }
        for child in child_pids(pid, table) {
            visit(child, table, out);
        }
        out.push(pid);
    }
    let mut out = Vec::new();
    visit(root, table, &mut out);
    out
}

/// Parse one `/proc/<pid>/stat` line. The command name is parenthesised and
/// may itself contain spaces and parentheses, so fields are counted from the
/// last `)`.
pub fn parse_proc_stat(line: &str) -> Option<(u32, u32)> {
    let (head, tail) = line.rsplit_once(')')?;
    let pid = head.split_once('(')?.0.trim().parse().ok()?;
    let mut fields = tail.split_whitespace();
    let _state = fields.next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((pid, ppid))
}

/// Parse `ps -A -o pid=,ppid=` output.
pub fn parse_ps_output(output: &str) -> ProcessTable {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse().ok()?;
            let ppid = fields.next()?.parse().ok()?;
            Some((pid, ppid))
        })
        .collect()
}

#[cfg(unix)]
mod platform {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    use super::ProcessTable;
    use crate::process::LaunchError;

    #[cfg(target_os = "linux")]
    pub fn process_table() -> Result<ProcessTable, LaunchError> {
        let entries =
            std::fs::read_dir("/proc").map_err(|e| LaunchError::ProcessList(e.to_string()))?;
        let mut table = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            // Processes may vanish between listing and reading.
            let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
                continue;
            };
            if let Some(pair) = super::parse_proc_stat(&stat) {
                table.push(pair);
            }
        }
        Ok(table)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn process_table() -> Result<ProcessTable, LaunchError> {
        let output = std::process::Command::new("ps")
            .args(["-A", "-o", "pid=,ppid="])
            .output()
            .map_err(|e| LaunchError::ProcessList(e.to_string()))?;
        if !output.status.success() {
            return Err(LaunchError::ProcessList(format!("ps exited with {}", output.status)));
        }
        Ok(super::parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
    }

    #[allow(clippy::cast_possible_wrap)]
    pub fn kill(pid: u32) -> Result<(), LaunchError> {
        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(LaunchError::Kill {
                pid,
                reason: e.to_string(),
            }),
        }
    }

    /// The app leads its own process group; catch anything that escaped the
    /// parent links (double forks) but kept the group.
    #[allow(clippy::cast_possible_wrap)]
    pub fn kill_group(pgid: u32) {
        let _ = signal::killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL);
    }
}

#[cfg(windows)]
mod platform {
    use std::process::Command;

    use super::ProcessTable;
    use crate::process::LaunchError;

    pub fn process_table() -> Result<ProcessTable, LaunchError> {
        let output = Command::new("powershell")
            .args([
                "-NoProfile",
                "-Command",
                "Get-CimInstance Win32_Process | ForEach-Object { \"$($_.ProcessId) $($_.ParentProcessId)\" }",
            ])
            .output()
            .map_err(|e| LaunchError::ProcessList(e.to_string()))?;
        if !output.status.success() {
            return Err(LaunchError::ProcessList(format!(
                "powershell exited with {}",
                output.status
            )));
        }
        Ok(super::parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
    }

    pub fn kill(pid: u32) -> Result<(), LaunchError> {
        let status = Command::new("taskkill")
            .args(["/F", "/PID", &pid.to_string()])
            .output()
            .map_err(|e| LaunchError::Kill {
                pid,
                reason: e.to_string(),
            })?;
        // taskkill exits 128 when the process is already gone.
        match status.status.code() {
            Some(0 | 128) => Ok(()),
            _ => Err(LaunchError::Kill {
                pid,
                reason: String::from_utf8_lossy(&status.stderr).trim().to_string(),
            }),
        }
    }

    pub fn kill_group(_pgid: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_order_is_children_first() {
        // 1 ─┬─ 2 ─── 4
        //    └─ 3
        // 9 is unrelated.
        let table = vec![(1, 0), (2, 1), (3, 1), (4, 2), (9, 0)];
        let order = kill_order(1, &table);
        assert_eq!(order.len(), 4);
        assert_eq!(order.last(), Some(&1));
        let pos = |pid| order.iter().position(|&p| p == pid).unwrap();
        assert!(pos(4) < pos(2));
        assert!(!order.contains(&9));
    }

    #[test]
    fn kill_order_tolerates_self_parented_entries() {
        let table = vec![(0, 0), (1, 0)];
        assert_eq!(kill_order(0, &table), vec![1, 0]);
    }

    #[test]
    fn proc_stat_with_awkward_command_name() {
        assert_eq!(
            parse_proc_stat("4242 (my (odd) proc) S 17 4242 4242 0 -1 4194560"),
            Some((4242, 17))
        );
        assert_eq!(parse_proc_stat("garbage"), None);
    }

    #[test]
    fn ps_output_parsing() {
        let table = parse_ps_output("    1     0\n  310     1\nnot a row\n");
        assert_eq!(table, vec![(1, 0), (310, 1)]);
    }

    #[cfg(target_os = "linux")]
    fn is_running(pid: u32) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| {
                let (_, tail) = stat.rsplit_once(')')?;
                tail.split_whitespace().next().map(|state| state != "Z" && state != "X")
            })
            .unwrap_or(false)
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn kills_app_and_grandchildren() {
        use crate::process::{CommandGenerator, LaunchSpec};

        let gen = CommandGenerator::new(LaunchSpec {
            entrypoint: vec![
                "sh".into(),
                "-c".into(),
                "sleep 30 & sleep 30 & wait".into(),
            ],
            working_dir: std::env::temp_dir(),
            ..LaunchSpec::default()
        })
        .unwrap();
        let mut app = gen.spawn().unwrap();
        let pid = app.id();

        let mut children = Vec::new();
        for _ in 0..50 {
            children = child_pids(pid, &platform::process_table().unwrap());
            if children.len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(children.len(), 2);

        app.kill_tree().await.unwrap();

        for _ in 0..100 {
            if children.iter().all(|&c| !is_running(c)) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(!is_running(pid));
        for child in children {
            assert!(!is_running(child), "pid {child} survived");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn killing_a_missing_process_is_an_error() {
        let mut done = tokio::process::Command::new("true").spawn().unwrap();
        let pid = done.id().unwrap();
        done.wait().await.unwrap();

        let err = kill_process_tree(pid).unwrap_err();
        assert!(matches!(err, LaunchError::NoSuchProcess(p) if p == pid));
    }
}
