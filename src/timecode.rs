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

//! Timecode and target frame arithmetic. Everything downstream of the fps
//! multiplication happens on 64 bit integers.

use std::time::Instant;

pub type Frames = i64;
pub type Fps = f64;

/// Parses an `HH:MM:SS:FF` timecode into a frame count.
///
/// The frame field is not clamped to `fps - 1`; an overflowing `FF` simply
/// adds to the total. Malformed input yields 0, it never fails.
pub fn parse_tc(tc: &str, fps: Fps) -> Frames {
    let mut parts = tc.split(':');
    let hh = field(parts.next());
    let mm = field(parts.next());
    let ss = field(parts.next());
    let ff = field(parts.next());
    match (hh, mm, ss, ff, parts.next()) {
        (Some(hh), Some(mm), Some(ss), Some(ff), None) => {
            ((hh * 3600 + mm * 60 + ss) as f64 * fps) as Frames + ff
        }
        _ => 0,
    }
}

fn field(part: Option<&str>) -> Option<Frames> {
    let part = part?;
    if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

/// Inverse of [`parse_tc`] for frame counts whose `FF` component is below
/// `fps`.
pub fn format_tc(frames: Frames, fps: Fps) -> String {
    let total_secs = (frames as f64 / fps).floor() as Frames;
    let ff = frames - (total_secs as f64 * fps) as Frames;
    let hh = total_secs / 3600;
    let mm = (total_secs % 3600) / 60;
    let ss = total_secs % 60;
    format!("{hh:02}:{mm:02}:{ss:02}:{ff:02}")
}

/// Frames elapsed on the logical wall clock since `t0`.
pub fn elapsed_frames(t0: Instant, now: Instant, fps: Fps) -> Frames {
    (now.duration_since(t0).as_secs_f64() * fps) as Frames
}

/// Wraps a frame index into `[0, loop_frames)`.
pub fn wrap_frame(frame: Frames, loop_frames: Frames) -> Frames {
    frame.rem_euclid(loop_frames.max(1))
}

/// The frame a slot should be on right now, given the shared base frame and
/// the slot's start timecode offset.
pub fn slot_target_frame(base_frame: Frames, tc_frames: Frames, loop_frames: Frames) -> Frames {
    wrap_frame(base_frame + tc_frames, loop_frames)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parse_tc_works() {
        assert_eq!(parse_tc("00:00:00:00", 50.0), 0);
        assert_eq!(parse_tc("00:00:01:00", 50.0), 50);
        assert_eq!(parse_tc("00:03:24:05", 50.0), 10205);
        assert_eq!(parse_tc("01:00:00:00", 25.0), 90000);
    }

    #[test]
    fn parse_tc_does_not_clamp_frame_overflow() {
        // ff >= fps continues arithmetically
        assert_eq!(parse_tc("00:00:00:30", 25.0), 30);
        assert_eq!(parse_tc("00:00:01:99", 50.0), 149);
    }

    #[test]
    fn parse_tc_yields_zero_on_malformed_input() {
        assert_eq!(parse_tc("", 50.0), 0);
        assert_eq!(parse_tc("00:00:00", 50.0), 0);
        assert_eq!(parse_tc("00:00:00:00:00", 50.0), 0);
        assert_eq!(parse_tc("0:00:00:00", 50.0), 0);
        assert_eq!(parse_tc("00:00:00:0a", 50.0), 0);
        assert_eq!(parse_tc("-1:00:00:00", 50.0), 0);
        assert_eq!(parse_tc("garbage", 50.0), 0);
    }

    #[test]
    fn format_tc_round_trips() {
        for fps in [25.0, 50.0] {
            for frames in [0, 1, 49, 50, 1499, 10205, 29999] {
                let ff = frames - ((frames as f64 / fps).floor() * fps) as i64;
                if (ff as f64) < fps {
                    assert_eq!(parse_tc(&format_tc(frames, fps), fps), frames);
                }
            }
        }
    }

    #[test]
    fn format_tc_formats_fields() {
        assert_eq!(format_tc(10205, 50.0), "00:03:24:05");
        assert_eq!(format_tc(0, 50.0), "00:00:00:00");
    }

    #[test]
    fn elapsed_frames_tracks_the_clock() {
        let t0 = Instant::now();
        assert_eq!(elapsed_frames(t0, t0 + Duration::from_secs(1), 50.0), 50);
        assert_eq!(elapsed_frames(t0, t0 + Duration::from_millis(500), 50.0), 25);
    }

    #[test]
    fn target_frame_wraps_at_loop_boundary() {
        let t0 = Instant::now();
        // 600 s at 50 fps is exactly one 30000 frame loop
        let base = elapsed_frames(t0, t0 + Duration::from_secs(600), 50.0);
        assert_eq!(slot_target_frame(base, 0, 30000), 0);
        let base = elapsed_frames(t0, t0 + Duration::from_secs(1), 50.0);
        assert_eq!(slot_target_frame(base, 0, 30000), 50);
    }

    #[test]
    fn target_frame_folds_in_timecode_offset() {
        assert_eq!(slot_target_frame(100, 29950, 30000), 50);
        assert_eq!(slot_target_frame(0, 10205, 30000), 10205);
    }

    #[test]
    fn target_frame_is_monotonic_modulo_loop() {
        let t0 = Instant::now();
        let mut last = 0;
        for ms in (0..5000).step_by(100) {
            let base = elapsed_frames(t0, t0 + Duration::from_millis(ms), 50.0);
            let tf = slot_target_frame(base, 0, 30000);
            assert!(tf >= last);
            last = tf;
        }
    }
}
