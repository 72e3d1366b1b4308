//! Configuration loading and resolution.
//!
//! An optional TOML file supplies defaults; command-line flags override it.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::{Args, AudioBackend, SourceBackend};
pub use stream_sync::config::SyncConfig;

pub const DEFAULT_HTTP_BIND: &str = "0.0.0.0:5556";
pub const DEFAULT_PRESENT_FPS: u32 = 60;

/// Top-level file configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Output device substring.
    pub device: Option<String>,
    /// HTTP API bind address (host:port).
    pub http_bind: Option<String>,
    /// Presentation ticks per second.
    pub present_fps: Option<u32>,
    /// Engine tuning overrides.
    pub sync: SyncSection,
}

/// `[sync]` table. Durations are in milliseconds.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSection {
    pub reconnect_attempts: Option<u32>,
    pub reconnect_delay_ms: Option<u64>,
    pub audio_tick_ms: Option<u64>,
    pub hardware_buffers: Option<usize>,
    pub audio_queue_capacity: Option<usize>,
    pub throttle_target_ms: Option<u64>,
    pub throttle_max_sleep_ms: Option<u64>,
    pub marshal_timeout_ms: Option<u64>,
    pub init_timeout_ms: Option<u64>,
    pub cleanup_timeout_ms: Option<u64>,
    pub join_timeout_ms: Option<u64>,
    pub initial_buffer_timeout_ms: Option<u64>,
    pub idle_wait_ms: Option<u64>,
    pub video_high_watermark: Option<usize>,
    pub video_low_watermark: Option<usize>,
    pub audio_full_ratio: Option<f32>,
    pub fetch_debounce_ms: Option<u64>,
    pub max_audio_priority_ms: Option<u64>,
}

/// Settings shared by `play` and `listen`.
#[derive(Clone, Debug)]
pub struct PlayerConfig {
    pub device: Option<String>,
    pub audio: AudioBackend,
    pub source: SourceBackend,
    pub present_fps: u32,
    pub sync: SyncConfig,
}

#[derive(Clone, Debug)]
pub struct PlayConfig {
    pub url: String,
    pub format: Option<String>,
    pub player: PlayerConfig,
}

#[derive(Clone, Debug)]
pub struct ListenConfig {
    pub http_bind: SocketAddr,
    pub player: PlayerConfig,
}

impl FileConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<FileConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }

    /// Load `args.config` when given, otherwise use an empty config.
    pub fn from_args(args: &Args) -> Result<Self> {
        match args.config.as_deref() {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

impl SyncSection {
    /// Overlay the file values on `base` and validate the result.
    pub fn apply(&self, base: SyncConfig) -> Result<SyncConfig> {
        let ms = Duration::from_millis;
        let mut cfg = base;
        if let Some(v) = self.reconnect_attempts {
            cfg.reconnect_attempts = v;
        }
        if let Some(v) = self.reconnect_delay_ms {
            cfg.reconnect_delay = ms(v);
        }
        if let Some(v) = self.audio_tick_ms {
            cfg.audio_tick = ms(v);
        }
        if let Some(v) = self.hardware_buffers {
            cfg.hardware_buffers = v;
            cfg.audio_queue_capacity = v * 2;
        }
        if let Some(v) = self.audio_queue_capacity {
            cfg.audio_queue_capacity = v;
        }
        if let Some(v) = self.throttle_target_ms {
            cfg.throttle_target = ms(v);
        }
        if let Some(v) = self.throttle_max_sleep_ms {
            cfg.throttle_max_sleep = ms(v);
        }
        if let Some(v) = self.marshal_timeout_ms {
            cfg.marshal_timeout = ms(v);
        }
        if let Some(v) = self.init_timeout_ms {
            cfg.init_timeout = ms(v);
        }
        if let Some(v) = self.cleanup_timeout_ms {
            cfg.cleanup_timeout = ms(v);
        }
        if let Some(v) = self.join_timeout_ms {
            cfg.join_timeout = ms(v);
        }
        if let Some(v) = self.initial_buffer_timeout_ms {
            cfg.initial_buffer_timeout = ms(v);
        }
        if let Some(v) = self.idle_wait_ms {
            cfg.idle_wait = ms(v);
        }
        if let Some(v) = self.video_high_watermark {
            cfg.fetch.video_high_watermark = v;
        }
        if let Some(v) = self.video_low_watermark {
            cfg.fetch.video_low_watermark = v;
        }
        if let Some(v) = self.audio_full_ratio {
            cfg.fetch.audio_full_ratio = v;
        }
        if let Some(v) = self.fetch_debounce_ms {
            cfg.fetch.debounce = ms(v);
        }
        if let Some(v) = self.max_audio_priority_ms {
            cfg.fetch.max_audio_priority_dwell = ms(v);
        }
        validate(&cfg)?;
        Ok(cfg)
    }
}

fn validate(cfg: &SyncConfig) -> Result<()> {
    if cfg.reconnect_attempts == 0 {
        anyhow::bail!("sync.reconnect_attempts must be at least 1");
    }
    if cfg.audio_tick.is_zero() {
        anyhow::bail!("sync.audio_tick_ms must be greater than 0");
    }
    if cfg.hardware_buffers == 0 || cfg.audio_queue_capacity == 0 {
        anyhow::bail!("sync.hardware_buffers and sync.audio_queue_capacity must be greater than 0");
    }
    if cfg.fetch.video_low_watermark > cfg.fetch.video_high_watermark {
        anyhow::bail!(
            "sync.video_low_watermark ({}) is above sync.video_high_watermark ({})",
            cfg.fetch.video_low_watermark,
            cfg.fetch.video_high_watermark
        );
    }
    if !(cfg.fetch.audio_full_ratio > 0.0 && cfg.fetch.audio_full_ratio <= 1.0) {
        anyhow::bail!("sync.audio_full_ratio must be in (0, 1]");
    }
    Ok(())
}

/// Merge file values and flags into the shared player settings.
pub fn player_config(args: &Args, file: &FileConfig) -> Result<PlayerConfig> {
    let device = normalize_device_name(args.device.clone().or_else(|| file.device.clone()));
    let present_fps = args
        .present_fps
        .or(file.present_fps)
        .unwrap_or(DEFAULT_PRESENT_FPS);
    if present_fps == 0 {
        anyhow::bail!("present_fps must be greater than 0");
    }
    Ok(PlayerConfig {
        device,
        audio: args.audio,
        source: args.source,
        present_fps,
        sync: file.sync.apply(SyncConfig::default())?,
    })
}

/// Resolve the HTTP bind address: flag, then file, then the default.
pub fn http_bind(args: &Args, file: &FileConfig) -> Result<SocketAddr> {
    if let Some(bind) = args.http_bind {
        return Ok(bind);
    }
    let raw = file.http_bind.as_deref().unwrap_or(DEFAULT_HTTP_BIND);
    raw.parse()
        .with_context(|| format!("parse http_bind {raw}"))
}

fn normalize_device_name(device: Option<String>) -> Option<String> {
    device
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}
