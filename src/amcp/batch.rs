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

use crate::timecode::Frames;

/// An ordered list of commands the remote applies in a single render cycle.
///
/// On the wire the commands are framed by `DEFER` and `RESUME`. A batch
/// never mixes slots that target different connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    lines: Vec<String>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: String) {
        self.lines.push(line);
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn commands(&self) -> &[String] {
        &self.lines
    }

    /// The batch as wire lines, including the envelope.
    pub fn envelope(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.lines.len() + 2);
        lines.push("DEFER".to_owned());
        lines.extend(self.lines.iter().cloned());
        lines.push("RESUME".to_owned());
        lines
    }
}

fn layer_address(channel: u32, layer: u32) -> String {
    format!("{channel}-{layer}")
}

pub fn loadbg(channel: u32, layer: u32, clip: &str, seek: Frames) -> String {
    format!(
        "LOADBG {} \"{clip}\" SEEK {seek} LOOP",
        layer_address(channel, layer)
    )
}

pub fn play(channel: u32, layer: u32) -> String {
    format!("PLAY {}", layer_address(channel, layer))
}

pub fn pause(channel: u32, layer: u32) -> String {
    format!("PAUSE {}", layer_address(channel, layer))
}

/// `ramp_frames = 0` is an instantaneous set, anything else a timed linear
/// ramp.
pub fn mixer_opacity(channel: u32, layer: u32, value: u8, ramp_frames: u32) -> String {
    mixer(channel, layer, "OPACITY", value, ramp_frames)
}

pub fn mixer_volume(channel: u32, layer: u32, value: u8, ramp_frames: u32) -> String {
    mixer(channel, layer, "VOLUME", value, ramp_frames)
}

fn mixer(channel: u32, layer: u32, property: &str, value: u8, ramp_frames: u32) -> String {
    let address = layer_address(channel, layer);
    if ramp_frames == 0 {
        format!("MIXER {address} {property} {value} 0")
    } else {
        format!("MIXER {address} {property} {value} {ramp_frames} LINEAR")
    }
}

/// Query for the layer's current frame. Sent outside any envelope.
pub fn call_frame(channel: u32, layer: u32) -> String {
    format!("CALL {} FRAME", layer_address(channel, layer))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn commands_match_the_wire_format() {
        assert_eq!(
            loadbg(1, 10, "media/a.mov", 0),
            "LOADBG 1-10 \"media/a.mov\" SEEK 0 LOOP"
        );
        assert_eq!(play(1, 20), "PLAY 1-20");
        assert_eq!(pause(2, 10), "PAUSE 2-10");
        assert_eq!(mixer_opacity(1, 10, 0, 0), "MIXER 1-10 OPACITY 0 0");
        assert_eq!(mixer_opacity(1, 10, 1, 4), "MIXER 1-10 OPACITY 1 4 LINEAR");
        assert_eq!(mixer_volume(1, 10, 1, 0), "MIXER 1-10 VOLUME 1 0");
        assert_eq!(call_frame(1, 10), "CALL 1-10 FRAME");
    }

    #[test]
    fn envelope_frames_the_commands() {
        let mut batch = Batch::new();
        batch.push(play(1, 10));
        batch.push(pause(1, 20));
        assert_eq!(
            batch.envelope(),
            vec!["DEFER", "PLAY 1-10", "PAUSE 1-20", "RESUME"]
        );
    }
}
