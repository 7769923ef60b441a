//! Host process calculator
//!
//! Runs `sh -c "<command> -in <input> > <stdout>"` inside `root/uid`.
//! Only meaningful together with a [`LocalBackend`](crate::LocalBackend)
//! sharing the same root.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use wait_timeout::ChildExt;

use super::{CalcErrorKind, CalcReport, CalcRequest, Calculator};

/// Default deadline for one calculation (1 hour)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct ProgramCalculator {
    root: PathBuf,
    timeout: Duration,
}

impl ProgramCalculator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Name of the file that receives the program's stdout
    pub fn stdout_name(request: &CalcRequest) -> String {
        match request.input_file.rsplit_once('.') {
            Some((stem, _)) => format!("{stem}.pwo"),
            None => format!("{}.pwo", request.input_file),
        }
    }
}

impl Calculator for ProgramCalculator {
    fn calculate(&self, request: &CalcRequest) -> anyhow::Result<CalcReport> {
        let Some(command) = request.command.as_deref() else {
            return Ok(CalcReport::failed(
                CalcErrorKind::MissingCommand,
                format!("no command configured for '{}'", request.program),
                0.0,
            ));
        };

        let workdir = self.root.join(&request.uid);
        let line = format!(
            "{command} -in {} > {}",
            request.input_file,
            Self::stdout_name(request)
        );
        debug!(uid = %request.uid, command = %line, "spawning calculation");

        let start = Instant::now();
        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(&line)
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return Ok(CalcReport::failed(
                    CalcErrorKind::SpawnFailed,
                    format!("failed to spawn '{line}': {e}"),
                    0.0,
                ))
            }
        };

        match child.wait_timeout(self.timeout)? {
            Some(status) => {
                let walltime = start.elapsed().as_secs_f64();
                if status.success() {
                    return Ok(CalcReport::completed(walltime));
                }
                let stderr = child
                    .stderr
                    .take()
                    .map(|mut s| {
                        let mut buf = String::new();
                        s.read_to_string(&mut buf).ok();
                        buf
                    })
                    .unwrap_or_default();
                let message = if stderr.trim().is_empty() {
                    format!("Command exited with code: {}", status.code().unwrap_or(-1))
                } else {
                    stderr.trim().to_string()
                };
                Ok(CalcReport::failed(CalcErrorKind::ProcessFailed, message, walltime))
            }
            None => {
                warn!(uid = %request.uid, timeout = ?self.timeout, "calculation timed out");
                let _ = child.kill();
                let _ = child.wait();
                Ok(CalcReport::failed(
                    CalcErrorKind::Timeout,
                    format!("Calculation timed out after {:?}", self.timeout),
                    start.elapsed().as_secs_f64(),
                ))
            }
        }
    }
}
