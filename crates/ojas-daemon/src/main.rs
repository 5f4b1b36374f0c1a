//! ojasd: OJAS VPN session daemon
//!
//! Loads the server catalog, brings up the session controller with its
//! threat pipeline, and holds a session open until Ctrl+C.
//!
//! Usage: `ojasd [CONFIG] [SERVER]`

use anyhow::{Context, Result, bail};
use ojas_core::{
    DelayedLink, MonitorError, OjasConfig, SessionController, TelemetrySample, TelemetrySource,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Simulated tunnel handshake time
const HANDSHAKE: Duration = Duration::from_secs(2);

/// Chance per poll that a simulated attack starts
const ATTACK_CHANCE: f64 = 0.02;

/// Synthetic traffic analyzer: quiet traffic with occasional attack bursts
struct SimulatedTraffic {
    rng: StdRng,
    /// Polls left in the current burst
    burst_left: u32,
    burst_len: u32,
}

impl SimulatedTraffic {
    fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            burst_left: 0,
            burst_len: 0,
        }
    }
}

impl TelemetrySource for SimulatedTraffic {
    fn sample(&mut self) -> Result<TelemetrySample, MonitorError> {
        if self.burst_left == 0 {
            if !self.rng.gen_bool(ATTACK_CHANCE) {
                return Ok(TelemetrySample::quiet());
            }
            self.burst_len = self.rng.gen_range(3..10);
            self.burst_left = self.burst_len;
        }

        // Ramp from probing to a full attack over the burst
        let progress = 1.0 - self.burst_left as f32 / self.burst_len as f32;
        self.burst_left -= 1;
        let score = (0.45 + progress * 0.5 + self.rng.gen_range(0.0..0.05)).min(1.0);
        Ok(TelemetrySample::scored(score, format!("anomalous flow pattern ({score:.2})")))
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<OjasConfig> {
    match path {
        Some(path) => OjasConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => {
            info!("No config file given, using built-in catalog");
            Ok(OjasConfig::default_config())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let _subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .compact()
        .init();

    info!("ojasd starting...");

    let mut args = std::env::args().skip(1);
    let config_path = args.next().map(PathBuf::from);
    let config = load_config(config_path.as_ref())?;
    let server = args.next().or_else(|| config.auto_connect.clone());

    let controller = SessionController::builder(config)
        .link(DelayedLink::new(HANDSHAKE))
        .build()
        .context("starting session controller")?;

    for s in controller.list_servers() {
        info!("  {:<4} {} ({}) [{}]", s.id, s.name, s.location, s.health);
    }

    controller.subscribe(|snapshot| info!("{}", snapshot.summary()));
    let _pipeline = controller.spawn_threat_pipeline(Box::new(SimulatedTraffic::new()));

    let server = match server {
        Some(id) => id,
        None => match controller.directory().best_server() {
            Some(best) => best.id,
            None => bail!("no usable server in catalog"),
        },
    };

    controller
        .connect(&server)
        .await
        .with_context(|| format!("connecting to {server}"))?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl+C")?;
    info!("Ctrl+C received, shutting down");

    if let Err(e) = controller.disconnect().await {
        warn!("Disconnect failed: {}", e);
    }

    let kill_switch = controller.kill_switch();
    info!("Kill switch: {:?}", kill_switch.state());
    info!("ojasd shut down");
    Ok(())
}
