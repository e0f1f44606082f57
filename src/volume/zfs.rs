//! Volume binding that drives the `zfs` command-line tool

use super::{SnapshotInfo, VolumeBinding, VolumeError};
use chrono::{DateTime, Utc};
use std::io::{self, Read, Write};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Runs `zfs` subcommands, optionally through `sudo`
#[derive(Debug, Clone)]
pub struct ZfsCommand {
    program: String,
    use_sudo: bool,
}

impl Default for ZfsCommand {
    fn default() -> Self {
        Self::new("zfs", false)
    }
}

impl ZfsCommand {
    /// Create a binding that runs `program` (usually `zfs`)
    pub fn new(program: impl Into<String>, use_sudo: bool) -> Self {
        Self {
            program: program.into(),
            use_sudo,
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(&self.program);
            cmd
        } else {
            Command::new(&self.program)
        };
        cmd.args(args);
        cmd
    }

    fn describe(&self, args: &[&str]) -> String {
        let mut parts = Vec::with_capacity(args.len() + 2);
        if self.use_sudo {
            parts.push("sudo");
        }
        parts.push(self.program.as_str());
        parts.extend_from_slice(args);
        parts.join(" ")
    }

    /// Run a command to completion and return its stdout
    fn run(&self, args: &[&str]) -> Result<String, VolumeError> {
        let description = self.describe(args);
        debug!("Running: {}", description);

        let output = self
            .command(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| VolumeError::Spawn {
                command: description.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("dataset does not exist") {
                return Err(VolumeError::NotFound(stderr));
            }
            return Err(VolumeError::CommandFailed {
                command: description,
                status: output.status.to_string(),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// List filesystems and volumes across all imported pools
    pub fn list_filesystems(&self) -> Result<Vec<String>, VolumeError> {
        let stdout = self.run(&["list", "-H", "-o", "name", "-t", "filesystem,volume"])?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Parse `zfs list -H -p -o name,creation,used` output for one filesystem
fn parse_snapshot_list(
    filesystem: &str,
    command: &str,
    stdout: &str,
) -> Result<Vec<SnapshotInfo>, VolumeError> {
    let parse_error = |line: &str| VolumeError::Parse {
        command: command.to_string(),
        line: line.to_string(),
    };

    let mut snapshots = Vec::new();
    for line in stdout.lines() {
        if line.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 3 {
            return Err(parse_error(line));
        }

        let (dataset, name) = fields[0].split_once('@').ok_or_else(|| parse_error(line))?;
        if dataset != filesystem {
            continue;
        }

        let created_secs: i64 = fields[1].parse().map_err(|_| parse_error(line))?;
        let created = DateTime::<Utc>::from_timestamp(created_secs, 0).ok_or_else(|| parse_error(line))?;
        let used_bytes: u64 = fields[2].parse().map_err(|_| parse_error(line))?;

        snapshots.push(SnapshotInfo {
            name: name.to_string(),
            created,
            used_bytes,
        });
    }

    snapshots.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.name.cmp(&b.name)));
    Ok(snapshots)
}

impl VolumeBinding for ZfsCommand {
    fn list_snapshots(&self, filesystem: &str) -> Result<Vec<SnapshotInfo>, VolumeError> {
        let args = [
            "list", "-H", "-p", "-t", "snapshot", "-d", "1", "-o", "name,creation,used", "-s",
            "creation", filesystem,
        ];
        let stdout = self.run(&args)?;
        parse_snapshot_list(filesystem, &self.describe(&args), &stdout)
    }

    fn create_snapshot(&self, filesystem: &str, name: &str) -> Result<(), VolumeError> {
        let full_name = format!("{}@{}", filesystem, name);
        self.run(&["snapshot", &full_name])?;
        Ok(())
    }

    fn destroy_snapshot(&self, filesystem: &str, name: &str) -> Result<(), VolumeError> {
        let full_name = format!("{}@{}", filesystem, name);
        self.run(&["destroy", &full_name])?;
        Ok(())
    }

    fn compute_delta(
        &self,
        filesystem: &str,
        base: Option<&str>,
        target: &str,
    ) -> Result<Box<dyn Read + Send>, VolumeError> {
        let target_name = format!("{}@{}", filesystem, target);
        let base_name = base.map(|b| format!("{}@{}", filesystem, b));

        let mut args = vec!["send"];
        if let Some(base_name) = base_name.as_deref() {
            args.push("-i");
            args.push(base_name);
        }
        args.push(&target_name);

        let description = self.describe(&args);
        debug!("Starting: {}", description);

        let mut child = self
            .command(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| VolumeError::Spawn {
                command: description.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| VolumeError::Spawn {
            command: description.clone(),
            source: io::Error::other("stdout not captured"),
        })?;
        let stderr_drain = drain_stderr(&mut child);

        Ok(Box::new(SendStream {
            command: description,
            child: Some(child),
            stdout,
            stderr_drain,
        }))
    }

    fn apply_delta(&self, filesystem: &str, stream: &mut dyn Read) -> Result<(), VolumeError> {
        let args = ["receive", "-F", filesystem];
        let description = self.describe(&args);
        debug!("Starting: {}", description);

        let mut child = self
            .command(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| VolumeError::Spawn {
                command: description.clone(),
                source,
            })?;

        let stderr_drain = drain_stderr(&mut child);
        let copy_result = match child.stdin.take() {
            Some(mut stdin) => io::copy(stream, &mut stdin).and_then(|_| stdin.flush()),
            None => Err(io::Error::other("stdin not captured")),
        };

        if let Err(e) = copy_result {
            warn!("Aborting {}: {}", description, e);
            let _ = child.kill();
            let _ = child.wait();
            return Err(VolumeError::Io(e));
        }

        let status = child.wait()?;
        let stderr = stderr_drain.map(|h| h.join().unwrap_or_default()).unwrap_or_default();
        if !status.success() {
            return Err(VolumeError::CommandFailed {
                command: description,
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

fn drain_stderr(child: &mut Child) -> Option<JoinHandle<String>> {
    child.stderr.take().map(|mut stderr| {
        thread::spawn(move || {
            let mut text = String::new();
            let _ = stderr.read_to_string(&mut text);
            text
        })
    })
}

/// Stdout of a running `zfs send`. A non-zero exit is reported as a read
/// error once the stream is exhausted, so a truncated send is never mistaken
/// for a complete one.
struct SendStream {
    command: String,
    child: Option<Child>,
    stdout: ChildStdout,
    stderr_drain: Option<JoinHandle<String>>,
}

impl SendStream {
    fn finish(&mut self) -> io::Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait()?;
        let stderr = self
            .stderr_drain
            .take()
            .map(|h| h.join().unwrap_or_default())
            .unwrap_or_default();
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "{} exited with {}: {}",
                self.command,
                status,
                stderr.trim()
            )))
        }
    }
}

impl Read for SendStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.child.is_none() {
            return Ok(0);
        }
        let n = self.stdout.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.finish()?;
        }
        Ok(n)
    }
}

impl Drop for SendStream {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
