//! Public-tunnel supervision for the hook endpoint.
//!
//! Runs a cloudflared quick tunnel and keeps it alive: bounded retries with
//! an increasing delay schedule, automatic restart when an established
//! tunnel dies unexpectedly, and a terminal `stop()` that suppresses every
//! further attempt. Callers must tolerate `public_url()` returning `None`
//! and fall back to the local address — tether keeps working local-only
//! when the tunnel never comes up.

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Delay before retry N of a connect sequence.
pub const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(5),
    Duration::from_secs(15),
    Duration::from_secs(30),
];

/// Retries per connect sequence (initial attempt not counted).
pub const MAX_RETRIES: usize = 3;

const URL_TIMEOUT: Duration = Duration::from_secs(30);
const EXIT_POLL: Duration = Duration::from_millis(250);
const STOP_POLL: Duration = Duration::from_millis(50);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Retry budget exhausted; local-only from here on.
    Failed,
    /// `stop()` was called; terminal.
    Stopped,
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to spawn tunnel process: {0}")]
    Spawn(String),
    #[error("no tunnel URL within {}s", .0.as_secs())]
    UrlTimeout(Duration),
}

/// Delay to wait before retry `attempt` (0-based), or `None` once the
/// budget is exhausted.
pub fn retry_delay(attempt: usize, delays: &[Duration]) -> Option<Duration> {
    delays.get(attempt).copied()
}

struct TunnelInner {
    state: TunnelState,
    url: Option<String>,
    child: Option<Child>,
}

pub struct TunnelManager {
    command: Vec<String>,
    local_url: String,
    delays: Vec<Duration>,
    url_timeout: Duration,
    probe: bool,
    inner: Arc<Mutex<TunnelInner>>,
    stopped: Arc<AtomicBool>,
}

impl TunnelManager {
    pub fn new(port: u16) -> Self {
        Self {
            command: vec![
                "cloudflared".to_string(),
                "tunnel".to_string(),
                "--no-autoupdate".to_string(),
                "--url".to_string(),
            ],
            local_url: format!("http://localhost:{port}"),
            delays: RETRY_DELAYS[..MAX_RETRIES].to_vec(),
            url_timeout: URL_TIMEOUT,
            probe: true,
            inner: Arc::new(Mutex::new(TunnelInner {
                state: TunnelState::Disconnected,
                url: None,
                child: None,
            })),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Test hook: custom argv prefix, schedule, and probe policy.
    #[cfg(test)]
    pub fn with_command(
        command: Vec<String>,
        port: u16,
        delays: Vec<Duration>,
        url_timeout: Duration,
    ) -> Self {
        let mut manager = Self::new(port);
        manager.command = command;
        manager.delays = delays;
        manager.url_timeout = url_timeout;
        manager.probe = false;
        manager
    }

    pub fn state(&self) -> TunnelState {
        self.inner.lock().unwrap().state
    }

    /// Last known public URL, or `None` when the tunnel is down.
    pub fn public_url(&self) -> Option<String> {
        self.inner.lock().unwrap().url.clone()
    }

    /// Run the connect/reconnect loop on a background thread.
    pub fn start(self: &Arc<Self>) -> std::thread::JoinHandle<()> {
        let manager = Arc::clone(self);
        std::thread::spawn(move || manager.run())
    }

    fn run(&self) {
        // An unexpected exit of an established tunnel restarts the whole
        // retry sequence; only stop() or an exhausted budget ends the loop.
        let mut ever_connected = false;
        'sequence: loop {
            let mut attempt = 0usize;
            loop {
                if self.stopped.load(Ordering::SeqCst) {
                    self.enter_stopped();
                    return;
                }

                self.set_state(if ever_connected {
                    TunnelState::Reconnecting
                } else {
                    TunnelState::Connecting
                });

                match self.acquire() {
                    Ok(url) => {
                        info!(url = %url, "tunnel connected");
                        ever_connected = true;
                        self.set_state(TunnelState::Connected);
                        if self.probe {
                            probe_url(&url);
                        }

                        self.monitor();
                        if self.stopped.load(Ordering::SeqCst) {
                            self.enter_stopped();
                            return;
                        }
                        warn!("tunnel exited unexpectedly, restarting retry sequence");
                        continue 'sequence;
                    }
                    Err(e) => {
                        warn!(attempt, error = %e, "tunnel connect attempt failed");
                        let Some(delay) = retry_delay(attempt, &self.delays) else {
                            warn!("tunnel retry budget exhausted, continuing local-only");
                            self.set_state(TunnelState::Failed);
                            return;
                        };
                        attempt += 1;
                        if !self.sleep_unless_stopped(delay) {
                            self.enter_stopped();
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Spawn the tunnel process and scrape the assigned public URL from its
    /// stderr within the acquisition budget.
    fn acquire(&self) -> Result<String, TunnelError> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .arg(&self.local_url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| TunnelError::Spawn(e.to_string()))?;
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel::<String>();
        std::thread::spawn(move || {
            let Some(stderr) = stderr else { return };
            let url_pattern = Regex::new(r"https://[a-zA-Z0-9-]+\.trycloudflare\.com").unwrap();
            let mut sent = false;
            // Keep draining after the URL so the pipe never fills.
            for line in BufReader::new(stderr).lines() {
                let Ok(line) = line else { break };
                if !sent && let Some(m) = url_pattern.find(&line) {
                    sent = tx.send(m.as_str().to_string()).is_ok();
                }
            }
        });

        match rx.recv_timeout(self.url_timeout) {
            Ok(url) => {
                let mut inner = self.inner.lock().unwrap();
                inner.url = Some(url.clone());
                inner.child = Some(child);
                Ok(url)
            }
            Err(_) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(TunnelError::UrlTimeout(self.url_timeout))
            }
        }
    }

    /// Block until the tunnel process exits or `stop()` is requested.
    fn monitor(&self) {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            {
                let mut inner = self.inner.lock().unwrap();
                let exited = match inner.child.as_mut() {
                    Some(child) => child.try_wait().map(|s| s.is_some()).unwrap_or(true),
                    None => true,
                };
                if exited {
                    inner.child = None;
                    inner.url = None;
                    return;
                }
            }
            std::thread::sleep(EXIT_POLL);
        }
    }

    fn sleep_unless_stopped(&self, duration: Duration) -> bool {
        let deadline = std::time::Instant::now() + duration;
        while std::time::Instant::now() < deadline {
            if self.stopped.load(Ordering::SeqCst) {
                return false;
            }
            std::thread::sleep(STOP_POLL.min(duration));
        }
        !self.stopped.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: TunnelState) {
        self.inner.lock().unwrap().state = state;
    }

    fn enter_stopped(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(mut child) = inner.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        inner.url = None;
        inner.state = TunnelState::Stopped;
    }

    /// Terminal stop: kills the process and suppresses every future retry
    /// and reconnect, including ones already scheduled.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.enter_stopped();
        debug!("tunnel stopped");
    }
}

/// Where deep links should point: the tunnel when one is up, else nothing
/// (callers fall back to the local address).
pub trait PublicUrlSource: Send + Sync {
    fn public_url(&self) -> Option<String>;
}

impl PublicUrlSource for TunnelManager {
    fn public_url(&self) -> Option<String> {
        TunnelManager::public_url(self)
    }
}

/// Local-only mode: no tunnel configured.
pub struct NoTunnel;

impl PublicUrlSource for NoTunnel {
    fn public_url(&self) -> Option<String> {
        None
    }
}

fn probe_url(url: &str) {
    // Best-effort reachability check; failures are informational only.
    match ureq::get(url).timeout(PROBE_TIMEOUT).call() {
        Ok(_) => debug!(url = %url, "tunnel probe ok"),
        Err(e) => debug!(url = %url, error = %e, "tunnel probe failed"),
    }
}
