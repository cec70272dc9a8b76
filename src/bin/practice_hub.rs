//! Headless dashboard runner.
//!
//! Loads config and preferences, resolves the configured identity, keeps the
//! dashboard synced against the HTTP endpoints and prints the immediate
//! actions bar whenever it changes. Ctrl-C saves a cache snapshot and exits.
//!
//! Usage: `practice-hub` (config at ~/.practice-hub/config.json, or the path
//! in `PRACTICE_HUB_CONFIG`). Commands on stdin, one per line:
//! `c` toggles the collapsed bar, `d` toggles demo mode, `r` refreshes now.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use practice_hub_lib::bar::{BarController, BarView};
use practice_hub_lib::config::{load_config, Config, LogFormat};
use practice_hub_lib::fetch::HttpFetcher;
use practice_hub_lib::prefs::{load_preferences, preferences_path};
use practice_hub_lib::realtime::SseChangeSource;
use practice_hub_lib::state::Dashboard;
use practice_hub_lib::util;

fn init_logging(config: &Config) {
    match config.logging.format {
        LogFormat::Text => {
            env_logger::Builder::from_env(
                env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
            )
            .init();
        }
        LogFormat::Json => {
            // log records are bridged into tracing by init()
            let filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config().map_err(|e| anyhow::anyhow!("Failed to load config: {e}"))?;
    init_logging(&config);

    let prefs_path = preferences_path()?;
    let prefs = load_preferences(&prefs_path);
    let fetcher = Arc::new(HttpFetcher::new(&config.api)?);
    let source = Arc::new(SseChangeSource::new(&config.api)?);
    let snapshot_path = match &config.sync.snapshot_path {
        Some(path) => path.clone(),
        None => util::state_dir()?.join("cache.json"),
    };
    let grace = Duration::from_millis(config.sync.empty_grace_ms);
    let identity = config.identity.clone();

    let dashboard = Dashboard::new(config, prefs.clone(), fetcher);
    dashboard.set_preferences_path(prefs_path);
    match dashboard.load_snapshot(&snapshot_path) {
        Ok(count) => log::info!("Loaded {} cached entries", count),
        Err(e) => log::warn!("Ignoring cache snapshot: {}", e),
    }
    dashboard.start_realtime(source);
    dashboard.start_poller();

    match identity {
        Some(identity) => {
            dashboard.set_identity(identity);
        }
        None => log::warn!("No identity configured, waiting with an empty dashboard"),
    }

    let mut bar = BarController::new(grace, prefs.actions_collapsed);
    let mut feed = dashboard.actions();
    let mut shown: Option<BarView> = None;
    let mut commands = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let current = feed.borrow_and_update().clone();
        let now = Instant::now();
        let view = bar.view(&current, now);
        if shown.as_ref() != Some(&view) {
            println!("{}", view);
            shown = Some(view);
        }

        tokio::select! {
            changed = feed.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = sleep_until(bar.next_wakeup(now)) => {}
            line = commands.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match line.trim() {
                    "c" => {
                        let collapsed = !bar.is_collapsed();
                        bar.set_collapsed(collapsed);
                        dashboard.set_actions_collapsed(collapsed);
                    }
                    "d" => dashboard.set_demo_mode(!dashboard.preferences().demo_mode),
                    "r" => {
                        dashboard.refresh_all();
                        dashboard.poll_now();
                    }
                    "" => {}
                    other => log::warn!("Unknown command '{}' (c, d or r)", other),
                },
                Ok(None) => stdin_open = false,
                Err(e) => {
                    log::warn!("Stopped reading commands: {}", e);
                    stdin_open = false;
                }
            },
            _ = &mut ctrl_c => {
                log::info!("Shutting down");
                break;
            }
        }
    }

    dashboard.shutdown();
    match dashboard.save_snapshot(&snapshot_path) {
        Ok(count) => log::info!("Saved {} cached entries", count),
        Err(e) => log::warn!("Failed to save cache snapshot: {}", e),
    }
    Ok(())
}
