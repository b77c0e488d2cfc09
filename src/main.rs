use effect_bridge::sandbox::{self, PlayerState};
use effect_bridge::{Config, EffectBridge};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(err) = run().await {
        tracing::error!(error = %err, "fatal");
        std::process::exit(1);
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::args().nth(1).as_deref() == Some("config-init") {
        let path = Config::default_path();
        Config::write_default(&path)?;
        tracing::info!(path = %path.display(), "wrote default config");
        return Ok(());
    }

    let config = Config::load()?;
    tracing::info!(
        endpoint = %config.connection.endpoint(),
        tick_rate_hz = config.host.tick_rate_hz,
        "effect bridge starting"
    );

    let mut bridge = EffectBridge::new(config.connection.clone(), sandbox::registry(), Handle::current());
    bridge.set_despawn(sandbox::despawn);
    let mut player = PlayerState::default();
    bridge.on_ready();

    let mut ticker = tokio::time::interval(config.host.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut last_tick = Instant::now();
    let mut last_state = bridge.connection_state();

    loop {
        tokio::select! {
            res = &mut shutdown => {
                if let Err(err) = res {
                    tracing::warn!(error = %err, "ctrl-c listener failed");
                }
                tracing::info!("shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                bridge.on_tick(&mut player, now - last_tick);
                last_tick = now;

                let state = bridge.connection_state();
                if state != last_state {
                    tracing::info!(from = ?last_state, to = ?state, "controller link");
                    last_state = state;
                }
            }
        }
    }

    bridge.on_teardown(&mut player);
    tracing::info!(
        health = player.health,
        stamina = player.stamina,
        money = player.money,
        "final player state"
    );
    Ok(())
}
