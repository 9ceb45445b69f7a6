//! Bounded subprocess execution.
//!
//! Every tmux/ps/git invocation in tether goes through `run_with_timeout` so
//! a wedged multiplexer or a slow process table can never stall a hook or a
//! chat reply for more than a few seconds. Output pipes are drained on
//! dedicated threads to avoid deadlocking on full pipe buffers.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Collected result of a bounded subprocess run.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

fn drain(pipe: Option<impl Read + Send + 'static>) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn wait_bounded(child: &mut Child, timeout: Duration, what: &str) -> Result<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("failed to poll {what}"))?
        {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            bail!("{what} timed out after {}ms", timeout.as_millis());
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Run a command to completion, killing it if it exceeds `timeout`.
pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<CommandOutput> {
    let what = format!("command '{:?}'", cmd.get_program());
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().with_context(|| format!("failed to spawn {what}"))?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = wait_bounded(&mut child, timeout, &what)?;

    Ok(CommandOutput {
        status,
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    })
}
