/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use crate::{
    amcp::DEFAULT_AMCP_PORT,
    error::{ConfigError, ConfigResult},
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::fs;
use tracing::{info, instrument, warn};

/// Number of slots the control surface can address.
pub const SLOT_CAPACITY: usize = 20;

#[derive(Parser)]
#[command(author, version, about, long_about)]
pub struct Args {
    /// Path to the persisted config file
    #[arg(short, long, env = "LOOPSYNC_CONFIG", default_value = "loopsync.json")]
    pub config: PathBuf,
    /// Port of the HTTP control surface
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResyncMode {
    Cut,
    Fade,
}

/// TCP tuning applied to every remote engine connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SocketOptions {
    pub keepalive_time_ms: Option<u64>,
    pub keepalive_interval_ms: Option<u64>,
    pub keepalive_retries: Option<u32>,
    pub user_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SlotConfig {
    pub id: u32,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub channel: u32,
    pub base_layer: u32,
    pub clip: String,
    pub start_timecode: String,
    pub enabled: bool,
}

impl Default for SlotConfig {
    fn default() -> Self {
        SlotConfig {
            id: 1,
            name: String::new(),
            host: String::new(),
            port: DEFAULT_AMCP_PORT,
            channel: 1,
            base_layer: 10,
            clip: String::new(),
            start_timecode: "00:00:00:00".to_owned(),
            enabled: false,
        }
    }
}

impl SlotConfig {
    /// Only effective slots produce wire traffic and status rows.
    pub fn is_effective(&self) -> bool {
        self.enabled && !self.host.is_empty() && !self.clip.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub fps: f64,
    /// Total frames in one clip cycle.
    pub frames: i64,
    pub autosync_interval_sec: u64,
    pub drift_tolerance_frames: i64,
    pub resync_mode: ResyncMode,
    pub fade_frames: u32,
    pub post_fade_delay_ms: Option<u64>,
    pub socket: SocketOptions,
    pub slots: Vec<SlotConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            fps: 50.0,
            frames: 30000,
            autosync_interval_sec: 10,
            drift_tolerance_frames: 2,
            resync_mode: ResyncMode::Cut,
            fade_frames: 2,
            post_fade_delay_ms: None,
            socket: SocketOptions::default(),
            slots: Vec::new(),
        }
    }
}

/// Whitelisted partial update received on `/api/config`. Unknown keys are
/// ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigPatch {
    pub fps: Option<f64>,
    pub frames: Option<i64>,
    pub autosync_interval_sec: Option<u64>,
    pub drift_tolerance_frames: Option<i64>,
    pub resync_mode: Option<ResyncMode>,
    pub fade_frames: Option<u32>,
    pub post_fade_delay_ms: Option<u64>,
    pub socket: Option<SocketOptions>,
    pub slots: Option<Vec<SlotConfig>>,
}

impl Config {
    pub fn sample() -> Self {
        Config {
            slots: vec![SlotConfig {
                id: 1,
                name: "Example".to_owned(),
                host: "127.0.0.1".to_owned(),
                clip: "loops/example.mov".to_owned(),
                ..SlotConfig::default()
            }],
            ..Config::default()
        }
    }

    /// Loads the persisted config. A missing file yields the sample config,
    /// which is also written to disk so the operator has something to edit.
    #[instrument]
    pub async fn load(path: &Path) -> ConfigResult<Config> {
        info!("Loading config …");
        match fs::read_to_string(path).await {
            Ok(content) => {
                let mut config: Config =
                    serde_json::from_str(&content).map_err(|source| ConfigError::Malformed {
                        path: path.to_owned(),
                        source,
                    })?;
                config.slots.truncate(SLOT_CAPACITY);
                config.validate()?;
                info!("Config loaded from {}", path.to_string_lossy());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "Config file {} not found, using sample config.",
                    path.to_string_lossy()
                );
                let config = Config::sample();
                config.save(path).await?;
                Ok(config)
            }
            Err(source) => Err(ConfigError::Unreadable {
                path: path.to_owned(),
                source,
            }),
        }
    }

    /// Atomic-replace write: the config lands in a temp file first and is
    /// renamed over the target.
    pub async fn save(&self, path: &Path) -> ConfigResult<()> {
        let unwritable = |source| ConfigError::Unwritable {
            path: path.to_owned(),
            source,
        };
        let json = serde_json::to_string_pretty(self).expect("config serialization is infallible");
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await.map_err(unwritable)?;
        fs::rename(&tmp, path).await.map_err(unwritable)?;
        info!("Config saved to {}", path.to_string_lossy());
        Ok(())
    }

    /// Applies a partial update and validates the result. `slots` beyond
    /// the capacity are dropped.
    pub fn merged(&self, patch: ConfigPatch) -> ConfigResult<Config> {
        let mut config = self.clone();
        if let Some(fps) = patch.fps {
            config.fps = fps;
        }
        if let Some(frames) = patch.frames {
            config.frames = frames;
        }
        if let Some(interval) = patch.autosync_interval_sec {
            config.autosync_interval_sec = interval;
        }
        if let Some(tolerance) = patch.drift_tolerance_frames {
            config.drift_tolerance_frames = tolerance;
        }
        if let Some(mode) = patch.resync_mode {
            config.resync_mode = mode;
        }
        if let Some(fade_frames) = patch.fade_frames {
            config.fade_frames = fade_frames;
        }
        if let Some(delay) = patch.post_fade_delay_ms {
            config.post_fade_delay_ms = Some(delay);
        }
        if let Some(socket) = patch.socket {
            config.socket = socket;
        }
        if let Some(mut slots) = patch.slots {
            slots.truncate(SLOT_CAPACITY);
            config.slots = slots;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if !(self.fps.is_finite() && self.fps > 0.0) {
            return Err(invalid("fps", "must be a positive number"));
        }
        if self.frames <= 0 {
            return Err(invalid("frames", "must be a positive integer"));
        }
        if self.autosync_interval_sec == 0 {
            return Err(invalid("autosyncIntervalSec", "must be at least 1"));
        }
        if self.drift_tolerance_frames < 0 {
            return Err(invalid("driftToleranceFrames", "must not be negative"));
        }
        if self.fade_frames == 0 {
            return Err(invalid("fadeFrames", "must be at least 1"));
        }
        for slot in &self.slots {
            if slot.channel == 0 {
                return Err(invalid("slots.channel", "must be at least 1"));
            }
            if slot.base_layer == 0 {
                return Err(invalid("slots.baseLayer", "must be at least 1"));
            }
        }
        Ok(())
    }

    /// How long a FADE resync waits between the cross-fade and parking the
    /// old layer. Defaults to the fade duration, rounded up to a full
    /// millisecond.
    pub fn post_fade_delay(&self) -> Duration {
        match self.post_fade_delay_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_millis(
                (self.fade_frames as f64 / self.fps * 1000.0).ceil() as u64
            ),
        }
    }

    pub fn autosync_interval(&self) -> Duration {
        Duration::from_secs(self.autosync_interval_sec)
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field,
        reason: reason.to_owned(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn slot(id: u32, host: &str, clip: &str, enabled: bool) -> SlotConfig {
        SlotConfig {
            id,
            host: host.to_owned(),
            clip: clip.to_owned(),
            enabled,
            ..SlotConfig::default()
        }
    }

    #[test]
    fn sample_config_is_valid() {
        assert!(Config::sample().validate().is_ok());
    }

    #[test]
    fn effectiveness_requires_enabled_host_and_clip() {
        assert!(slot(1, "10.0.0.1", "a.mov", true).is_effective());
        assert!(!slot(1, "10.0.0.1", "a.mov", false).is_effective());
        assert!(!slot(1, "", "a.mov", true).is_effective());
        assert!(!slot(1, "10.0.0.1", "", true).is_effective());
    }

    #[test]
    fn patch_merges_whitelisted_fields() {
        let config = Config::default();
        let patch: ConfigPatch =
            serde_json::from_str(r#"{"fps": 25, "resyncMode": "fade", "unknownKey": 7}"#).unwrap();
        let merged = config.merged(patch).unwrap();
        assert_eq!(merged.fps, 25.0);
        assert_eq!(merged.resync_mode, ResyncMode::Fade);
        assert_eq!(merged.frames, config.frames);
    }

    #[test]
    fn patch_rejects_invalid_values() {
        let config = Config::default();
        for body in [
            r#"{"fps": 0}"#,
            r#"{"fps": -25}"#,
            r#"{"frames": 0}"#,
            r#"{"autosyncIntervalSec": 0}"#,
            r#"{"driftToleranceFrames": -1}"#,
            r#"{"fadeFrames": 0}"#,
        ] {
            let patch: ConfigPatch = serde_json::from_str(body).unwrap();
            assert!(config.merged(patch).is_err(), "{body} should be rejected");
        }
    }

    #[test]
    fn patch_truncates_slots_to_capacity() {
        let slots: Vec<SlotConfig> = (1..=25)
            .map(|id| slot(id, "10.0.0.1", "a.mov", true))
            .collect();
        let merged = Config::default()
            .merged(ConfigPatch {
                slots: Some(slots),
                ..ConfigPatch::default()
            })
            .unwrap();
        assert_eq!(merged.slots.len(), SLOT_CAPACITY);
    }

    #[test]
    fn post_fade_delay_defaults_to_the_fade_duration() {
        let mut config = Config::default();
        config.fps = 50.0;
        config.fade_frames = 4;
        assert_eq!(config.post_fade_delay(), Duration::from_millis(80));
        config.post_fade_delay_ms = Some(200);
        assert_eq!(config.post_fade_delay(), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loopsync.json");
        let mut config = Config::default();
        config.slots.push(slot(1, "10.0.0.1", "a.mov", true));
        config.save(&path).await.unwrap();
        let loaded = Config::load(&path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn missing_file_yields_the_sample_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loopsync.json");
        let loaded = Config::load(&path).await.unwrap();
        assert_eq!(loaded, Config::sample());
        // and the sample has been written to disk
        assert!(path.exists());
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loopsync.json");
        tokio::fs::write(&path, "{not json").await.unwrap();
        assert!(matches!(
            Config::load(&path).await,
            Err(ConfigError::Malformed { .. })
        ));
    }
}
