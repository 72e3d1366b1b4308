//! Playback command worker.
//!
//! Serializes play/stop commands from the HTTP API onto one thread that owns session
//! starts, so a slow connect never blocks a request handler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, SendError, Sender};
use stream_sync::error::SessionError;
use stream_sync::profile;
use stream_sync::session::StreamPlayer;
use stream_sync_types::{Placement, SessionStatus};

/// Commands accepted by the playback worker thread.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PlayerCommand {
    Play {
        url: String,
        format: Option<String>,
        placement: Option<Placement>,
    },
    Stop,
}

/// Handle for sending commands to the playback worker.
#[derive(Clone)]
pub(crate) struct PlayerHandle {
    cmd_tx: Sender<PlayerCommand>,
    player: Arc<StreamPlayer>,
    /// Set while the worker is blocked in a session start.
    connecting: Arc<AtomicBool>,
}

impl PlayerHandle {
    /// Build a handle and the receiving end the worker drains.
    pub(crate) fn channel(player: Arc<StreamPlayer>) -> (Self, Receiver<PlayerCommand>) {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let handle = Self {
            cmd_tx,
            player,
            connecting: Arc::new(AtomicBool::new(false)),
        };
        (handle, cmd_rx)
    }

    pub(crate) fn send(&self, cmd: PlayerCommand) -> Result<(), SendError<PlayerCommand>> {
        self.cmd_tx.send(cmd)?;
        if self.connecting.load(Ordering::Acquire) {
            // a newer command supersedes the start the worker is blocked in
            self.player.stop();
        }
        Ok(())
    }

    pub(crate) fn status(&self) -> SessionStatus {
        self.player.status()
    }
}

/// Spawn the playback worker thread.
pub(crate) fn spawn_player(player: Arc<StreamPlayer>) -> std::io::Result<PlayerHandle> {
    let (handle, cmd_rx) = PlayerHandle::channel(player.clone());
    let connecting = handle.connecting.clone();
    std::thread::Builder::new()
        .name("player-worker".to_string())
        .spawn(move || player_thread_main(player, connecting, cmd_rx))?;
    Ok(handle)
}

/// Main loop for the playback worker.
fn player_thread_main(
    player: Arc<StreamPlayer>,
    connecting: Arc<AtomicBool>,
    cmd_rx: Receiver<PlayerCommand>,
) {
    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            PlayerCommand::Stop => {
                let report = player.stop();
                if report.had_session {
                    tracing::info!(
                        decode_joined = report.decode_joined,
                        audio_released = report.audio_released,
                        "stop handled"
                    );
                }
            }
            PlayerCommand::Play {
                url,
                format,
                placement,
            } => {
                let kind = profile::kind_from_hint(format.as_deref());
                tracing::info!(
                    url = %url,
                    kind = kind.label(),
                    placement = ?placement,
                    "play received"
                );
                connecting.store(true, Ordering::Release);
                let result = player.start_with_placement(&url, kind, placement);
                connecting.store(false, Ordering::Release);
                match result {
                    Ok(session) => tracing::info!(
                        url = %session.url,
                        kind = session.kind.label(),
                        "play started"
                    ),
                    Err(SessionError::Cancelled) => tracing::info!(url = %url, "play cancelled"),
                    Err(e) => tracing::warn!(url = %url, error = %e, "play failed"),
                }
            }
        }
    }
    player.stop();
    tracing::debug!("player worker exiting");
}
