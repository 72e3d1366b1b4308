//! Player runtime helpers.
//!
//! Builds the engine from the resolved config and runs the `play` and `listen` modes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use stream_sync::SessionEndReason;
use stream_sync::cpal_voice::CpalVoiceFactory;
use stream_sync::device;
use stream_sync::profile;
use stream_sync::session::{SessionEvent, StreamPlayer};
use stream_sync::sim::{SyntheticOpener, WallClockVoiceFactory};
use stream_sync::source::SourceOpener;
use stream_sync::symphonia_source::SymphoniaOpener;
use stream_sync::voice::VoiceFactory;

use crate::cli::{AudioBackend, SourceBackend};
use crate::config::{ListenConfig, PlayConfig, PlayerConfig};
use crate::surface::HeadlessSurface;
use crate::{http_api, player};

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    let names = device::list_devices(&host)?;
    if names.is_empty() {
        println!("no output devices");
    }
    for name in names {
        println!("{name}");
    }
    Ok(())
}

/// Play one stream until Ctrl-C or until the session ends on its own.
pub fn run_play(config: PlayConfig) -> Result<()> {
    let player = build_player(&config.player);
    install_ctrlc(player.clone());
    spawn_presenter(player.clone(), config.player.present_fps)?;

    let events = player.events();
    let kind = profile::kind_from_hint(config.format.as_deref());
    let session = player
        .start(&config.url, kind)
        .with_context(|| format!("start {}", config.url))?;
    tracing::info!(
        url = %session.url,
        kind = session.kind.label(),
        sample_rate = session.info.sample_rate,
        channels = session.info.channels,
        title = session.info.title.as_deref().unwrap_or(""),
        "playing"
    );

    while let Ok(event) = events.recv() {
        log_event(&event);
        if let SessionEvent::Ended { reason } = event {
            player.stop();
            return match reason {
                SessionEndReason::Stopped => Ok(()),
                other => Err(anyhow::anyhow!("session ended: {other:?}")),
            };
        }
    }
    Ok(())
}

/// Run the HTTP API and the playback worker until the server exits.
pub fn run_listen(config: ListenConfig) -> Result<()> {
    let player = build_player(&config.player);
    install_ctrlc(player.clone());
    spawn_presenter(player.clone(), config.player.present_fps)?;
    spawn_event_logger(player.events())?;

    let handle = player::spawn_player(player.clone()).context("spawn player worker")?;
    let http = http_api::spawn_http_server(config.http_bind, handle).context("spawn http api")?;
    let _ = http.join();
    player.stop();
    Ok(())
}

fn build_player(config: &PlayerConfig) -> Arc<StreamPlayer> {
    let opener: Arc<dyn SourceOpener> = match config.source {
        SourceBackend::Symphonia => Arc::new(SymphoniaOpener),
        SourceBackend::Synthetic => Arc::new(SyntheticOpener::test_pattern()),
    };
    let voices: Arc<dyn VoiceFactory> = match config.audio {
        AudioBackend::Cpal => Arc::new(CpalVoiceFactory {
            device: config.device.clone(),
        }),
        AudioBackend::Null => Arc::new(WallClockVoiceFactory),
    };
    tracing::info!(
        source = ?config.source,
        audio = ?config.audio,
        device = config.device.as_deref().unwrap_or("default"),
        "player backends"
    );
    Arc::new(StreamPlayer::new(opener, voices, config.sync.clone()))
}

fn install_ctrlc(player: Arc<StreamPlayer>) {
    let result = ctrlc::set_handler(move || {
        let report = player.stop();
        if report.had_session && !report.decode_joined {
            tracing::warn!("decode thread still running at exit");
        }
        std::process::exit(130);
    });
    if let Err(e) = result {
        tracing::warn!(error = %e, "ctrl-c handler not installed");
    }
}

/// Drive `present_tick` at `fps` from a dedicated presentation thread.
fn spawn_presenter(player: Arc<StreamPlayer>, fps: u32) -> Result<()> {
    let interval = tick_interval(fps);
    std::thread::Builder::new()
        .name("present".to_string())
        .spawn(move || {
            let mut surface = HeadlessSurface::new();
            loop {
                player.present_tick(&mut surface);
                std::thread::sleep(interval);
            }
        })
        .context("spawn presentation thread")?;
    Ok(())
}

fn spawn_event_logger(events: Receiver<SessionEvent>) -> Result<()> {
    std::thread::Builder::new()
        .name("session-events".to_string())
        .spawn(move || {
            while let Ok(event) = events.recv() {
                log_event(&event);
            }
        })
        .context("spawn event logger")?;
    Ok(())
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::Started { url, kind } => {
            tracing::info!(url = %url, kind = kind.label(), "session started")
        }
        SessionEvent::Buffered { buffered_ms } => {
            tracing::info!(buffered_ms, "buffering complete")
        }
        SessionEvent::Reconnecting { attempt } => tracing::warn!(attempt, "reconnecting"),
        SessionEvent::Reconnected => tracing::info!("reconnected"),
        SessionEvent::Ended { reason } => match reason {
            SessionEndReason::Stopped => tracing::info!("session ended"),
            other => tracing::warn!(reason = ?other, "session ended"),
        },
    }
}

fn tick_interval(fps: u32) -> Duration {
    Duration::from_secs(1) / fps.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;

    #[test]
    fn tick_interval_divides_a_second() {
        assert_eq!(tick_interval(50), Duration::from_millis(20));
        assert_eq!(tick_interval(0), Duration::from_secs(1));
    }

    #[test]
    fn synthetic_backends_start_a_session() {
        let config = PlayerConfig {
            device: None,
            audio: AudioBackend::Null,
            source: SourceBackend::Synthetic,
            present_fps: 30,
            sync: SyncConfig {
                audio_tick: Duration::from_millis(10),
                ..SyncConfig::default()
            },
        };
        let player = build_player(&config);
        let session = player
            .start("synthetic://pattern", stream_sync::StreamKind::Auto)
            .expect("start");
        assert_eq!((session.info.width, session.info.height), (64, 36));
        assert!(player.is_active());
        assert!(player.stop().decode_joined);
    }
}
