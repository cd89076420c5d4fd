//! sonoff-lan: command-line client for Sonoff switches in LAN mode.
//!
//! # Usage
//!
//! ```text
//! sonoff-lan [OPTIONS] [COMMAND]
//!
//! Commands:
//!   watch   Keep sessions open and log device events (default)
//!   set     Switch a device on or off, then exit
//!
//! Options:
//!   --config <PATH>       Config file [default: $XDG_CONFIG_HOME/sonoff-lan/config.toml]
//!   --host <HOST>         Device host; replaces the devices from the config file
//!   --port <PORT>         Device port [default: 8081]
//!   --keepalive <SECS>    Keepalive interval override
//!   --log-level <LEVEL>   Log filter used when RUST_LOG is unset
//! ```
//!
//! Every option can also come from the environment (`SONOFF_CONFIG`,
//! `SONOFF_HOST`, `SONOFF_PORT`, `SONOFF_KEEPALIVE`, `SONOFF_LOG_LEVEL`).
//! Command-line values take precedence.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use sonoff_client::domain::config::{ClientConfig, DeviceConfig};
use sonoff_client::infrastructure::load_config;
use sonoff_client::{ConnectionManager, ConnectionState, DeviceEvent};
use sonoff_core::SwitchState;

/// How long `set` waits for the device to echo the new state.
const ECHO_WAIT: Duration = Duration::from_secs(2);

// ── CLI argument definitions ──────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "sonoff-lan",
    about = "LAN-mode client for Sonoff smart switches",
    version
)]
struct Cli {
    /// Path of the TOML config file.
    #[arg(long, env = "SONOFF_CONFIG")]
    config: Option<PathBuf>,

    /// Device host.  When given, only this device is used.
    #[arg(long, env = "SONOFF_HOST")]
    host: Option<String>,

    /// Device port; applies to every configured device.
    #[arg(long, env = "SONOFF_PORT")]
    port: Option<u16>,

    /// Keepalive interval in seconds; applies to every configured device.
    #[arg(long, env = "SONOFF_KEEPALIVE")]
    keepalive: Option<u64>,

    /// `tracing` filter used when `RUST_LOG` is unset (e.g. `debug`).
    #[arg(long, env = "SONOFF_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand, PartialEq)]
enum Command {
    /// Keep sessions open and log every device event until Ctrl+C.
    Watch,
    /// Switch a device on or off.
    Set {
        /// `on` or `off`.
        state: SwitchState,
        /// Device id; defaults to the first device seen on the host.
        #[arg(long)]
        device: Option<String>,
        /// Outlet index (0-based) for multi-outlet devices.
        #[arg(long)]
        outlet: Option<u8>,
        /// Seconds to wait for the session and the device to appear.
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },
}

impl Cli {
    /// Applies command-line overrides to the configuration loaded from file.
    ///
    /// # Errors
    ///
    /// Returns an error if no device remains configured or an override has
    /// an unusable value.
    fn apply_overrides(&self, mut config: ClientConfig) -> anyhow::Result<ClientConfig> {
        if let Some(host) = &self.host {
            if host.trim().is_empty() {
                bail!("--host must not be empty");
            }
            config.devices = vec![DeviceConfig::new(host.trim())];
        }
        if let Some(port) = self.port {
            if port == 0 {
                bail!("--port must not be 0");
            }
            for device in &mut config.devices {
                device.port = port;
            }
        }
        if let Some(secs) = self.keepalive {
            if secs == 0 {
                bail!("--keepalive must be greater than 0");
            }
            for device in &mut config.devices {
                device.keepalive = Some(Duration::from_secs(secs));
            }
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if config.devices.is_empty() {
            bail!("no device configured; pass --host or add [[devices]] to the config file");
        }
        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let file_config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    let config = cli.apply_overrides(file_config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    match cli.command.unwrap_or(Command::Watch) {
        Command::Watch => watch(config).await,
        Command::Set {
            state,
            device,
            outlet,
            wait,
        } => set(config, state, device, outlet, Duration::from_secs(wait)).await,
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// Runs one connection manager per device and logs events until Ctrl+C.
async fn watch(config: ClientConfig) -> anyhow::Result<()> {
    let managers: Vec<ConnectionManager> = config
        .devices
        .iter()
        .map(|device| {
            ConnectionManager::new(device.clone(), config.policy.clone(), config.api_key.clone())
        })
        .collect();

    let mut loops = Vec::with_capacity(managers.len());
    for manager in &managers {
        tokio::spawn(log_events(manager.device().url(), manager.subscribe()));
        loops.push(manager.start());
    }
    info!(devices = managers.len(), "Watching; press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C; shutting down");

    for manager in &managers {
        manager.shutdown();
    }
    for handle in loops {
        if let Err(e) = handle.await {
            error!("connection task failed: {e}");
        }
    }
    Ok(())
}

async fn log_events(url: String, mut events: tokio::sync::broadcast::Receiver<DeviceEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => log_event(&url, &event),
            Err(RecvError::Lagged(missed)) => warn!(url = %url, missed, "Event log fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn log_event(url: &str, event: &DeviceEvent) {
    let entity = event.entity_id();
    match event {
        DeviceEvent::DeviceSeen { params, .. } => {
            info!(url, entity = %entity, model = ?params.model(), "Device seen");
        }
        DeviceEvent::StateChanged { state, .. } => {
            info!(url, entity = %entity, %state, "State changed");
        }
        DeviceEvent::AvailabilityChanged { online, .. } => {
            info!(url, entity = %entity, online, "Availability changed");
        }
    }
}

/// Connects to the first configured device, issues one command and exits.
async fn set(
    config: ClientConfig,
    state: SwitchState,
    device_id: Option<String>,
    outlet: Option<u8>,
    wait: Duration,
) -> anyhow::Result<()> {
    let device = config
        .devices
        .first()
        .cloned()
        .context("no device configured")?;
    let url = device.url();
    let manager = ConnectionManager::new(device, config.policy.clone(), config.api_key.clone());
    let mut events = manager.subscribe();
    let mut connection = manager.state();
    let handle = manager.start();

    let result = async {
        let deadline = Instant::now() + wait;
        let target = wait_for_device(&mut events, device_id, deadline)
            .await
            .with_context(|| format!("no device reported itself on {url} within {wait:?}"))?;
        timeout(
            deadline.saturating_duration_since(Instant::now()),
            connection.wait_for(|s| *s == ConnectionState::Ready),
        )
        .await
        .context("session did not become ready")?
        .context("connection manager stopped")?;

        manager
            .dispatcher()
            .request_state(&target, state, outlet)
            .await
            .with_context(|| format!("failed to switch {target} {state}"))?;
        info!(device_id = %target, ?outlet, %state, "Command sent");

        if wait_for_echo(&mut events, &target, outlet, state).await {
            info!(device_id = %target, "Device confirmed the new state");
        } else {
            warn!(device_id = %target, "No confirmation from device within {ECHO_WAIT:?}");
        }
        anyhow::Ok(())
    }
    .await;

    manager.shutdown();
    if let Err(e) = handle.await {
        error!("connection task failed: {e}");
    }
    result
}

/// Waits for the wanted device (or any device) to report its switch state.
/// A hello alone creates the device without state, so commands wait for this.
async fn wait_for_device(
    events: &mut tokio::sync::broadcast::Receiver<DeviceEvent>,
    wanted: Option<String>,
    deadline: Instant,
) -> anyhow::Result<String> {
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .context("timed out")?;
        match event {
            Ok(DeviceEvent::StateChanged { device_id, .. }) => match &wanted {
                Some(id) if *id != device_id => debug!(device_id = %device_id, "Skipping other device"),
                _ => return Ok(device_id),
            },
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => bail!("event channel closed"),
        }
    }
}

/// Waits briefly for the device to report the state just requested.
async fn wait_for_echo(
    events: &mut tokio::sync::broadcast::Receiver<DeviceEvent>,
    target: &str,
    outlet: Option<u8>,
    state: SwitchState,
) -> bool {
    let expected = DeviceEvent::StateChanged {
        device_id: target.to_string(),
        outlet,
        state,
    };
    let deadline = Instant::now() + ECHO_WAIT;
    while let Ok(event) = tokio::time::timeout_at(deadline, events.recv()).await {
        match event {
            Ok(event) if event == expected => return true,
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return false,
        }
    }
    false
}

// ── Tests ─────────────────────────────────────────────────────────────────────
