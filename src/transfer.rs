//! Transfer invoker: one external `copy` per work item.

use std::path::PathBuf;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::decode::decode_output;
use crate::state::Invocation;
use crate::types::Direction;

/// Verbosity at which command details and output are persisted.
pub const CAPTURE_VERBOSITY: u8 = 2;

/// Substrings of stderr that identify a rate-limited failure.
pub const DEFAULT_RATE_LIMIT_MARKERS: &[&str] = &[
    "429 Too Many Requests",
    "too_many_requests",
    "rateLimitExceeded",
];

/// Classified result of a single invocation.
#[derive(Debug, Clone)]
pub enum TransferOutcome {
    Success {
        invocation: Option<Invocation>,
    },
    Failure {
        /// Decoded stderr, or a description if the tool could not be started.
        reason: String,
        rate_limited: bool,
        invocation: Option<Invocation>,
    },
}

/// Errors starting the external tool.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

/// Anything that can copy `source` to `dest`.
#[async_trait]
pub trait Transfer: Send + Sync {
    /// Run one copy and wait for it to finish. Never cancelled midway.
    async fn invoke(&self, source: &str, dest: &str, verbosity: u8) -> TransferOutcome;
}

/// Source and destination prefixes for one transfer direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefixes {
    pub source: String,
    pub dest: String,
}

impl Prefixes {
    /// Build prefixes for a direction.
    ///
    /// `destination` must already be normalized (empty, or ending in `/`).
    pub fn new(direction: Direction, remote_name: &str, destination: &str, hostname: &str) -> Self {
        match direction {
            Direction::Backup => Self {
                source: String::new(),
                dest: format!("{remote_name}:{destination}{hostname}"),
            },
            Direction::Restore => Self {
                source: format!("{remote_name}:"),
                dest: destination.to_string(),
            },
        }
    }

    pub fn source_for(&self, path: &str) -> String {
        format!("{}{}", self.source, path)
    }

    pub fn dest_for(&self, path: &str) -> String {
        format!("{}{}", self.dest, path)
    }
}

/// Invokes `rclone copy` as a subprocess.
#[derive(Debug, Clone)]
pub struct RcloneTransfer {
    program: PathBuf,
    rate_limit_markers: Vec<String>,
}

impl RcloneTransfer {
    pub fn new(program: impl Into<PathBuf>, rate_limit_markers: Vec<String>) -> Self {
        Self {
            program: program.into(),
            rate_limit_markers,
        }
    }

    fn build_args(&self, source: &str, dest: &str, verbosity: u8) -> Vec<String> {
        let mut args = vec![
            self.program.to_string_lossy().into_owned(),
            "copy".to_string(),
            source.to_string(),
            dest.to_string(),
        ];
        if verbosity > 0 {
            args.push(format!("-{}", "v".repeat(verbosity as usize)));
        }
        args
    }

    async fn run(&self, args: &[String]) -> Result<Output, TransferError> {
        let mut command = Command::new(&self.program);
        command
            .args(&args[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group: a terminal Ctrl+C must not reach the child,
        // the in-flight copy always runs to completion.
        #[cfg(unix)]
        command.process_group(0);

        command.output().await.map_err(|source| TransferError::Spawn {
            program: self.program.display().to_string(),
            source,
        })
    }

    fn is_rate_limited(&self, stderr: &str) -> bool {
        let haystack = stderr.to_lowercase();
        self.rate_limit_markers
            .iter()
            .any(|marker| haystack.contains(&marker.to_lowercase()))
    }
}

/// Render arguments the way they are stored in `command_line`.
pub fn render_command_line(args: &[String]) -> String {
    args.iter()
        .map(|arg| format!("'{arg}'"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl Transfer for RcloneTransfer {
    async fn invoke(&self, source: &str, dest: &str, verbosity: u8) -> TransferOutcome {
        let args = self.build_args(source, dest, verbosity);
        let command_line = render_command_line(&args);
        tracing::debug!(command = %command_line, "Running transfer");

        let output = match self.run(&args).await {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(error = %e, "Transfer could not be started");
                return TransferOutcome::Failure {
                    reason: e.to_string(),
                    rate_limited: false,
                    invocation: None,
                };
            }
        };

        let stdout = decode_output(&output.stdout);
        let stderr = decode_output(&output.stderr);
        tracing::debug!("stdout:\n{}", stdout);
        tracing::debug!("stderr:\n{}", stderr);

        let returncode = output.status.code();
        let succeeded = output.status.success();
        let rate_limited = !succeeded && self.is_rate_limited(&stderr);

        let invocation = (verbosity >= CAPTURE_VERBOSITY).then(|| Invocation {
            args,
            command_line,
            returncode,
            stdout,
            stderr: stderr.clone(),
        });

        if succeeded {
            TransferOutcome::Success { invocation }
        } else {
            tracing::debug!(returncode = ?returncode, rate_limited, "Transfer failed");
            TransferOutcome::Failure {
                reason: stderr,
                rate_limited,
                invocation,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rclone() -> RcloneTransfer {
        RcloneTransfer::new(
            "rclone",
            DEFAULT_RATE_LIMIT_MARKERS.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_backup_prefixes() {
        let prefixes = Prefixes::new(Direction::Backup, "b2", "bucket/", "host1");
        assert_eq!(prefixes.source_for("/home/me"), "/home/me");
        assert_eq!(prefixes.dest_for("/home/me"), "b2:bucket/host1/home/me");
    }

    #[test]
    fn test_restore_prefixes() {
        let prefixes = Prefixes::new(Direction::Restore, "b2", "/restore/", "ignored");
        assert_eq!(
            prefixes.source_for("bucket/host1/home/me/"),
            "b2:bucket/host1/home/me/"
        );
        assert_eq!(
            prefixes.dest_for("bucket/host1/home/me/"),
            "/restore/bucket/host1/home/me/"
        );
    }

    #[test]
    fn test_restore_prefixes_empty_destination() {
        let prefixes = Prefixes::new(Direction::Restore, "b2", "", "host1");
        assert_eq!(prefixes.dest_for("bucket/x/"), "bucket/x/");
    }

    #[test]
    fn test_build_args_without_verbosity() {
        let args = rclone().build_args("/a", "b2:x/a", 0);
        assert_eq!(args, vec!["rclone", "copy", "/a", "b2:x/a"]);
    }

    #[test]
    fn test_build_args_with_verbosity() {
        let args = rclone().build_args("/a", "b2:x/a", 3);
        assert_eq!(args.last().map(String::as_str), Some("-vvv"));
    }

    #[test]
    fn test_render_command_line() {
        let args = vec!["rclone".to_string(), "copy".to_string(), "/a b".to_string()];
        assert_eq!(render_command_line(&args), "'rclone' 'copy' '/a b'");
    }

    #[test]
    fn test_rate_limit_detection_is_case_insensitive() {
        let t = rclone();
        assert!(t.is_rate_limited("ERROR : x: Failed to copy: 429 too many requests"));
        assert!(t.is_rate_limited("googleapi: Error 403: rateLimitExceeded"));
        assert!(!t.is_rate_limited("ERROR : directory not found"));
    }

    #[tokio::test]
    async fn test_missing_program_is_a_failure() {
        let t = RcloneTransfer::new("/nonexistent/rclone-binary", Vec::new());
        match t.invoke("/a", "b2:/a", 0).await {
            TransferOutcome::Failure {
                reason,
                rate_limited,
                invocation,
            } => {
                assert!(reason.contains("Failed to start"));
                assert!(!rate_limited);
                assert!(invocation.is_none());
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        /// Write an executable shell script standing in for rclone.
        fn fake_rclone(dir: &tempfile::TempDir, body: &str) -> PathBuf {
            let path = dir.path().join("rclone");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn transfer(program: PathBuf) -> RcloneTransfer {
            RcloneTransfer::new(
                program,
                DEFAULT_RATE_LIMIT_MARKERS.iter().map(|s| s.to_string()).collect(),
            )
        }

        #[tokio::test]
        async fn test_success_without_capture() {
            let dir = tempfile::tempdir().unwrap();
            let program = fake_rclone(&dir, "echo copied; exit 0");
            match transfer(program).invoke("/a", "r:/a", 1).await {
                TransferOutcome::Success { invocation } => assert!(invocation.is_none()),
                other => panic!("expected success, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_success_with_capture() {
            let dir = tempfile::tempdir().unwrap();
            let program = fake_rclone(&dir, "echo \"$@\"; echo note >&2; exit 0");
            match transfer(program).invoke("/a", "r:/a", 2).await {
                TransferOutcome::Success {
                    invocation: Some(invocation),
                } => {
                    assert_eq!(invocation.returncode, Some(0));
                    assert_eq!(invocation.stdout, "copy /a r:/a -vv\n");
                    assert_eq!(invocation.stderr, "note\n");
                    assert_eq!(invocation.args[1..], ["copy", "/a", "r:/a", "-vv"]);
                }
                other => panic!("expected captured success, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_failure_carries_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let program = fake_rclone(&dir, "echo 'directory not found' >&2; exit 3");
            match transfer(program).invoke("/a", "r:/a", 0).await {
                TransferOutcome::Failure {
                    reason,
                    rate_limited,
                    ..
                } => {
                    assert_eq!(reason, "directory not found\n");
                    assert!(!rate_limited);
                }
                other => panic!("expected failure, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_rate_limited_failure() {
            let dir = tempfile::tempdir().unwrap();
            let program = fake_rclone(&dir, "echo 'Error 429 Too Many Requests' >&2; exit 1");
            match transfer(program).invoke("/a", "r:/a", 0).await {
                TransferOutcome::Failure { rate_limited, .. } => assert!(rate_limited),
                other => panic!("expected failure, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_binary_stderr_is_hex() {
            let dir = tempfile::tempdir().unwrap();
            let program = fake_rclone(&dir, "printf '\\377\\376' >&2; exit 1");
            match transfer(program).invoke("/a", "r:/a", 0).await {
                TransferOutcome::Failure { reason, .. } => assert_eq!(reason, "fffe"),
                other => panic!("expected failure, got {other:?}"),
            }
        }
    }
}
