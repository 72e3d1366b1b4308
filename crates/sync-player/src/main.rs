//! Sync Player: plays a live audio/video stream with video paced by the audio clock.
//!
//! ## Modes
//! - `play`: play one stream headless until Ctrl-C or the session ends.
//! - `listen`: expose an HTTP API (`/play`, `/stop`, `/status`) and play on request.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sync_player::cli::{Args, Command};
use sync_player::config::{self, FileConfig, ListenConfig, PlayConfig};
use sync_player::runtime;

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,sync_player=info,stream_sync=info")
        }))
        .init();

    if args.list_devices {
        return runtime::list_devices();
    }

    let file = FileConfig::from_args(&args)?;
    let player = config::player_config(&args, &file)?;
    match &args.cmd {
        Some(Command::Play { url, format }) => runtime::run_play(PlayConfig {
            url: url.clone(),
            format: format.clone(),
            player,
        }),
        Some(Command::Listen) => runtime::run_listen(ListenConfig {
            http_bind: config::http_bind(&args, &file)?,
            player,
        }),
        None => anyhow::bail!("no command given; use `play <url>` or `listen` (see --help)"),
    }
}
