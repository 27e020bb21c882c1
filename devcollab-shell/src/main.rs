//! DevCollab Shell — headless console host for the sync kernels.
//!
//! Instantiates the offline write queue and the session negotiator from an
//! optional JSON settings file, then reads commands from stdin. Everything
//! observable (queue state, flush reports, call notices) is emitted as log
//! lines; set `RUST_LOG` to change verbosity.
//!
//! Usage: `devcollab-shell [settings.json]`

mod commands;
mod settings;
mod state;

use log::info;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};

use settings::{Settings, DEFAULT_SETTINGS_FILE};
use state::{AppState, Flow};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE));
    let settings = match Settings::load(&path) {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(2);
        }
    };

    info!("Starting DevCollab Shell...");
    let app = match AppState::start(&settings).await {
        Ok(app) => app,
        Err(e) => {
            log::error!("Start-up failed: {e}");
            std::process::exit(1);
        }
    };
    info!("Type `help` for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => break,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::error!("stdin: {e}");
                break;
            }
        };
        match commands::parse(&line) {
            Ok(Some(command)) => {
                if app.execute(command).await == Flow::Quit {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("{e}"),
        }
    }

    app.shutdown().await;
}
