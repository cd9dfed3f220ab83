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
    config::{ResyncMode, SLOT_CAPACITY},
    slot::SlotState,
    timecode::Frames,
};
use serde::{Deserialize, Serialize};

/// Process-wide operating mode. `Off` and `Manual` behave identically on
/// the server, only `Auto` runs the drift controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Mode {
    Off,
    Manual,
    Auto,
}

impl Mode {
    pub fn parse(value: &str) -> Option<Mode> {
        match value {
            "off" => Some(Mode::Off),
            "manual" => Some(Mode::Manual),
            "auto" => Some(Mode::Auto),
            _ => None,
        }
    }
}

/// Snapshot broadcast to WebSocket subscribers on connect and on every
/// controller tick. Only effective slots appear in `rows`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub mode: Mode,
    pub resync_mode: ResyncMode,
    pub fade_frames: u32,
    /// Milliseconds since the logical clock was last started, null before
    /// the first start.
    pub t0: Option<u64>,
    pub fps: f64,
    pub frames: Frames,
    pub autosync_interval_sec: u64,
    pub drift_tolerance_frames: Frames,
    pub slot_capacity: usize,
    /// Drift ticks skipped because the previous one was still running.
    pub dropped_ticks: u64,
    pub rows: Vec<StatusRow>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        StatusSnapshot {
            mode: Mode::Off,
            resync_mode: ResyncMode::Cut,
            fade_frames: 2,
            t0: None,
            fps: 50.0,
            frames: 30000,
            autosync_interval_sec: 10,
            drift_tolerance_frames: 2,
            slot_capacity: SLOT_CAPACITY,
            dropped_ticks: 0,
            rows: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRow {
    pub index: u32,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub channel: u32,
    pub base_layer: u32,
    pub active_layer: u32,
    pub standby_layer: u32,
    pub clip: String,
    pub timecode: String,
    pub state: SlotState,
    pub connected: bool,
    pub current_frame: Option<Frames>,
    pub target_frame: Frames,
    pub drift: Option<Frames>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mode_parses_operator_strings() {
        assert_eq!(Mode::parse("off"), Some(Mode::Off));
        assert_eq!(Mode::parse("manual"), Some(Mode::Manual));
        assert_eq!(Mode::parse("auto"), Some(Mode::Auto));
        assert_eq!(Mode::parse("AUTO"), None);
        assert_eq!(Mode::parse(""), None);
    }

    #[test]
    fn snapshot_serializes_camel_case_with_null_samples() {
        let snapshot = StatusSnapshot {
            rows: vec![StatusRow {
                index: 1,
                name: "A".to_owned(),
                host: "10.0.0.1".to_owned(),
                port: 5250,
                channel: 1,
                base_layer: 10,
                active_layer: 20,
                standby_layer: 10,
                clip: "a.mov".to_owned(),
                timecode: "00:00:00:00".to_owned(),
                state: crate::slot::SlotState::Playing,
                connected: true,
                current_frame: None,
                target_frame: 50,
                drift: None,
            }],
            ..StatusSnapshot::default()
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["resyncMode"], "cut");
        assert_eq!(json["slotCapacity"], 20);
        let row = &json["rows"][0];
        assert_eq!(row["baseLayer"], 10);
        assert_eq!(row["activeLayer"], 20);
        assert!(row["currentFrame"].is_null());
        assert!(row["drift"].is_null());
        assert_eq!(row["targetFrame"], 50);
    }
}
