use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "sync-player", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Audio output backend (`null` advances a wall clock instead of a device)
    #[arg(long, value_enum, default_value_t = AudioBackend::Cpal)]
    pub audio: AudioBackend,

    /// Live source backend
    #[arg(long, value_enum, default_value_t = SourceBackend::Symphonia)]
    pub source: SourceBackend,

    /// Optional TOML config file with a `[sync]` table
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// HTTP API bind address, e.g. 0.0.0.0:5556
    #[arg(long)]
    pub http_bind: Option<SocketAddr>,

    /// Presentation ticks per second
    #[arg(long)]
    pub present_fps: Option<u32>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play one live stream headless until Ctrl-C or the session ends
    Play {
        /// Stream URL (HLS playlist, HTTP live stream, or synthetic://...)
        url: String,

        /// Format hint: m3u8, flv, auto
        #[arg(long)]
        format: Option<String>,
    },

    /// Run the HTTP API for remote play/stop control
    Listen,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum AudioBackend {
    Cpal,
    Null,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SourceBackend {
    Symphonia,
    Synthetic,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_play_with_format() {
        let args = Args::try_parse_from([
            "sync-player",
            "--audio",
            "null",
            "play",
            "http://example.com/live/index.m3u8",
            "--format",
            "hls",
        ])
        .expect("parse");
        assert_eq!(args.audio, AudioBackend::Null);
        assert_eq!(args.source, SourceBackend::Symphonia);
        match args.cmd {
            Some(Command::Play { url, format }) => {
                assert_eq!(url, "http://example.com/live/index.m3u8");
                assert_eq!(format.as_deref(), Some("hls"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_listen_with_globals() {
        let args = Args::try_parse_from([
            "sync-player",
            "--source",
            "synthetic",
            "--http-bind",
            "127.0.0.1:7000",
            "--present-fps",
            "30",
            "listen",
        ])
        .expect("parse");
        assert!(matches!(args.cmd, Some(Command::Listen)));
        assert_eq!(args.source, SourceBackend::Synthetic);
        assert_eq!(args.http_bind.map(|a| a.port()), Some(7000));
        assert_eq!(args.present_fps, Some(30));
    }

    #[test]
    fn rejects_unknown_audio_backend() {
        assert!(Args::try_parse_from(["sync-player", "--audio", "alsa", "listen"]).is_err());
    }

    #[test]
    fn list_devices_needs_no_subcommand() {
        let args = Args::try_parse_from(["sync-player", "--list-devices"]).expect("parse");
        assert!(args.list_devices);
        assert!(args.cmd.is_none());
    }
}
