mod agent;
mod channel;
mod cli;
mod config;
mod dispatch;
mod exec;
mod form;
mod git;
mod paths;
mod process;
mod registry;
mod resolver;
mod responses;
mod server;
mod state;
mod timers;
mod tmux;
mod tunnel;

#[cfg(test)]
mod testsupport;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use agent::AgentRegistry;
use channel::{FormChannel, LogChannel, NotificationChannel};
use cli::{Cli, Command};
use config::Config;
use dispatch::EventDispatcher;
use form::{FormInjector, PendingFormTracker};
use registry::SessionRegistry;
use resolver::SessionResolver;
use responses::ResponseCache;
use server::{HookServer, ServerDeps};
use state::SessionStateMachine;
use timers::DeadlineArena;
use tmux::{TerminalBridge, TmuxBridge};
use tunnel::{NoTunnel, PublicUrlSource, TunnelManager};

const HOUSEKEEPING_TICK: Duration = Duration::from_secs(1);

fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_config_command = matches!(&cli.command, Command::Config { .. });

    let filter = match cli.verbose {
        0 if is_config_command => "tether=warn",
        0 => "tether=info",
        1 => "tether=debug",
        _ => "tether=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let (config, config_path) = Config::load()?;
    if !is_config_command {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no {} found, using defaults", paths::config_file().display()),
        }
    }

    match cli.command {
        Command::Serve { port, no_tunnel } => serve(config, port, no_tunnel),
        Command::Config { json } => {
            if json {
                println!("{}", render_config_json(&config)?);
            } else {
                print!("{}", render_config_human(&config));
            }
            Ok(())
        }
        Command::Sessions => list_sessions(&config),
    }
}

fn serve(config: Config, port_override: Option<u16>, no_tunnel: bool) -> Result<()> {
    let port = port_override.unwrap_or(config.hook.port);

    let bridge: Arc<dyn TerminalBridge> =
        Arc::new(TmuxBridge::new(&config.session.agent_process));
    let registry = SessionRegistry::new(paths::sessions_file());
    match registry.load() {
        Ok(count) if count > 0 => info!(sessions = count, "restored persisted sessions"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "could not restore sessions"),
    }

    let state = Arc::new(SessionStateMachine::new(registry.clone(), bridge.clone()));
    let resolver = Arc::new(SessionResolver::new(registry.clone(), state.clone()));
    let arena = Arc::new(DeadlineArena::new());
    let forms = Arc::new(PendingFormTracker::new(
        FormInjector::new(bridge.clone()),
        arena,
    ));
    let responses = Arc::new(ResponseCache::new(paths::responses_dir()));

    let log_channel = Arc::new(LogChannel);
    let notifier: Arc<dyn NotificationChannel> = log_channel.clone();
    let form_channel: Arc<dyn FormChannel> = log_channel;

    let hook_server = HookServer::bind(port)?;
    let bound_port = hook_server.port();

    let tunnel = if config.tunnel.enabled && !no_tunnel {
        Some(Arc::new(TunnelManager::new(bound_port)))
    } else {
        None
    };
    let public_url: Arc<dyn PublicUrlSource> = match &tunnel {
        Some(tunnel) => tunnel.clone(),
        None => Arc::new(NoTunnel),
    };
    if let Some(tunnel) = &tunnel {
        tunnel.start();
    }

    let dispatcher = Arc::new(EventDispatcher::new(
        AgentRegistry::new(),
        registry.clone(),
        resolver,
        forms.clone(),
        notifier,
        form_channel,
        responses.clone(),
        public_url,
        bound_port,
        config.tunnel.viewer_base_url.clone(),
    ));

    let server_handle = hook_server.spawn(ServerDeps {
        dispatcher,
        state,
        responses,
        secret: config.hook.secret.clone(),
        viewer_origin: config.tunnel.viewer_base_url.clone(),
    });

    // Housekeeping: expire pending forms every tick, reconcile panes every
    // scan interval, persist only when something moved.
    let stop = Arc::new(AtomicBool::new(false));
    let housekeeping = {
        let stop = stop.clone();
        let registry = registry.clone();
        let bridge = bridge.clone();
        let forms = forms.clone();
        let scan_every = Duration::from_secs(config.session.scan_interval_secs.max(1));
        std::thread::spawn(move || {
            let mut last_scan = std::time::Instant::now() - scan_every;
            while !stop.load(Ordering::SeqCst) {
                forms.expire_due();
                if last_scan.elapsed() >= scan_every {
                    let summary = registry.run_scan_cycle(bridge.as_ref());
                    if summary.changed {
                        info!(
                            discovered = summary.discovered.len(),
                            removed = summary.removed.len(),
                            total = summary.total,
                            "pane scan"
                        );
                    }
                    last_scan = std::time::Instant::now();
                }
                std::thread::sleep(HOUSEKEEPING_TICK);
            }
        })
    };

    info!(port = bound_port, "tether running — Ctrl-C to stop");

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("failed to install signal handler")?;
    }
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("shutting down");
    stop.store(true, Ordering::SeqCst);
    if let Some(tunnel) = &tunnel {
        tunnel.stop();
    }
    hook_server.stop();
    if let Err(e) = registry.save() {
        warn!(error = %e, "failed to persist sessions on shutdown");
    }
    let _ = housekeeping.join();
    let _ = server_handle.join();
    Ok(())
}

fn list_sessions(config: &Config) -> Result<()> {
    let registry = SessionRegistry::new(paths::sessions_file());
    registry.load()?;

    let mut sessions = registry.all();
    if sessions.is_empty() {
        println!("(no sessions)");
        return Ok(());
    }

    let bridge = TmuxBridge::new(&config.session.agent_process);
    let tree = process::ProcessTree::snapshot();

    sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
    for s in sessions {
        let liveness = if bridge.is_agent_alive_in_pane(&s.terminal_target, Some(&tree)) {
            "live"
        } else {
            "gone"
        };
        println!(
            "{:<24} {:<16} {:<8} {:<5} {:<16} {}",
            s.session_id,
            s.project,
            state_label(s.state),
            liveness,
            s.terminal_target,
            s.last_activity.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

fn state_label(state: registry::SessionState) -> &'static str {
    match state {
        registry::SessionState::Idle => "idle",
        registry::SessionState::Busy => "busy",
        registry::SessionState::Blocked => "blocked",
        registry::SessionState::Unknown => "unknown",
    }
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<20} {value}\n"));
}

fn render_config_human(config: &Config) -> String {
    let mut output = String::new();
    output.push_str("Hook\n");
    push_kv(&mut output, "port", config.hook.port);
    push_kv(
        &mut output,
        "secret",
        if config.hook.secret.is_empty() {
            "(unset)"
        } else {
            "(set)"
        },
    );
    push_kv(
        &mut output,
        "settle_delay",
        format!("{}ms", config.hook.settle_delay_ms),
    );
    output.push('\n');

    output.push_str("Session\n");
    push_kv(&mut output, "agent_process", &config.session.agent_process);
    push_kv(
        &mut output,
        "scan_interval",
        format!("{}s", config.session.scan_interval_secs),
    );
    output.push('\n');

    output.push_str("Tunnel\n");
    push_kv(&mut output, "enabled", config.tunnel.enabled);
    push_kv(&mut output, "viewer_base_url", &config.tunnel.viewer_base_url);

    output
}

fn render_config_json(config: &Config) -> Result<String> {
    let payload = serde_json::json!({
        "hook": {
            "port": config.hook.port,
            "secret_set": !config.hook.secret.is_empty(),
            "settle_delay_ms": config.hook.settle_delay_ms,
        },
        "session": {
            "agent_process": &config.session.agent_process,
            "scan_interval_secs": config.session.scan_interval_secs,
        },
        "tunnel": {
            "enabled": config.tunnel.enabled,
            "viewer_base_url": &config.tunnel.viewer_base_url,
        },
    });
    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_config_human_groups_sections() {
        let config = Config::default();
        let rendered = render_config_human(&config);
        assert!(rendered.contains("Hook"));
        assert!(rendered.contains("Session"));
        assert!(rendered.contains("Tunnel"));
        assert!(rendered.contains("(unset)"));
        assert!(rendered.contains("claude"));
    }

    #[test]
    fn render_config_json_is_valid_and_hides_secret() {
        let mut config = Config::default();
        config.hook.secret = "hunter2".to_string();
        let json = render_config_json(&config).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["hook"]["secret_set"], true);
        assert!(!json.contains("hunter2"));
        assert_eq!(value["session"]["agent_process"], "claude");
    }

    #[test]
    fn state_labels_cover_all_states() {
        assert_eq!(state_label(registry::SessionState::Idle), "idle");
        assert_eq!(state_label(registry::SessionState::Busy), "busy");
        assert_eq!(state_label(registry::SessionState::Blocked), "blocked");
        assert_eq!(state_label(registry::SessionState::Unknown), "unknown");
    }
}
