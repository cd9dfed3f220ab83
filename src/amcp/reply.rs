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

use crate::error::{ChannelError, ChannelResult};

/// One reply from the remote: a status line plus an optional payload.
///
/// Payload rules: code 200 is followed by data lines up to an empty line,
/// 201 and 400 by exactly one data line, everything else by none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub status: String,
    pub data: Vec<String>,
}

impl Reply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Interprets the reply payload as an integer frame index.
    pub fn frame(&self) -> Option<i64> {
        self.data.first()?.trim().parse().ok()
    }

    /// How many payload lines follow this status line on the wire.
    pub fn payload_shape(code: u16) -> PayloadShape {
        match code {
            200 => PayloadShape::UntilEmptyLine,
            201 | 400 => PayloadShape::OneLine,
            _ => PayloadShape::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    None,
    OneLine,
    UntilEmptyLine,
}

/// Parses a status line like `202 PLAY OK` into code and message.
pub fn parse_status_line(line: &str) -> ChannelResult<(u16, String)> {
    let trimmed = line.trim_end();
    let (code, rest) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ChannelError::Protocol(format!(
            "not a status line: {trimmed:?}"
        )));
    }
    let code = code
        .parse()
        .map_err(|_| ChannelError::Protocol(format!("not a status line: {trimmed:?}")))?;
    Ok((code, rest.to_owned()))
}
