use std::io::{ErrorKind, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::cancel::{CancelToken, Deadline};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum ToolRun {
    Exited { status: ExitStatus, stderr: String },
    Missing(String),
    TimedOut,
    Cancelled,
    Failed(String),
}

pub fn run_with_deadline(
    program: &Path,
    args: &[String],
    timeout: Duration,
    cancel: &CancelToken,
) -> ToolRun {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn();
    let mut child = match child {
        Ok(child) => child,
        Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::PermissionDenied) => {
            return ToolRun::Missing(format!("{}: {err}", program.display()));
        }
        Err(err) => return ToolRun::Failed(err.to_string()),
    };

    // The child must never block on a full stderr pipe.
    let stderr = drain_stderr(&mut child);
    let deadline = Deadline::after(timeout);
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let stderr = stderr
                    .and_then(|reader| reader.join().ok())
                    .unwrap_or_default();
                return ToolRun::Exited {
                    status,
                    stderr: stderr.trim().to_string(),
                };
            }
            Ok(None) => {}
            Err(err) => {
                kill(&mut child);
                return ToolRun::Failed(err.to_string());
            }
        }
        if cancel.is_cancelled() {
            kill(&mut child);
            return ToolRun::Cancelled;
        }
        if deadline.is_past() {
            kill(&mut child);
            return ToolRun::TimedOut;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn drain_stderr(child: &mut Child) -> Option<JoinHandle<String>> {
    let mut pipe = child.stderr.take()?;
    Some(thread::spawn(move || {
        let mut stderr = String::new();
        let _ = pipe.read_to_string(&mut stderr);
        stderr
    }))
}
