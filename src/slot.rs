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

use serde::Serialize;

/// Distance between a slot's active and standby layer on the remote.
pub const STANDBY_LAYER_OFFSET: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SlotState {
    Cold,
    Preloaded,
    Playing,
    Paused,
}

/// The two playback planes of a slot. Invariant: `{active, standby}` is
/// always `{base_layer, base_layer + 10}` in some order; the roles swap
/// only after a completed resync transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerPair {
    pub active: u32,
    pub standby: u32,
}

impl LayerPair {
    pub fn canonical(base_layer: u32) -> Self {
        LayerPair {
            active: base_layer,
            standby: base_layer + STANDBY_LAYER_OFFSET,
        }
    }

    pub fn swapped(self) -> Self {
        LayerPair {
            active: self.standby,
            standby: self.active,
        }
    }

    pub fn matches_base(&self, base_layer: u32) -> bool {
        let canonical = LayerPair::canonical(base_layer);
        *self == canonical || *self == canonical.swapped()
    }
}

/// Mutable per-slot state owned by the engine.
#[derive(Debug, Clone, Copy)]
pub struct SlotRuntime {
    pub pair: LayerPair,
    pub state: SlotState,
}

impl SlotRuntime {
    pub fn new(base_layer: u32) -> Self {
        SlotRuntime {
            pair: LayerPair::canonical(base_layer),
            state: SlotState::Cold,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn canonical_pair_is_base_and_base_plus_ten() {
        let pair = LayerPair::canonical(10);
        assert_eq!(pair.active, 10);
        assert_eq!(pair.standby, 20);
    }

    #[test]
    fn swapping_preserves_the_layer_set() {
        let pair = LayerPair::canonical(10);
        let swapped = pair.swapped();
        assert_eq!(swapped.active, 20);
        assert_eq!(swapped.standby, 10);
        assert!(pair.matches_base(10));
        assert!(swapped.matches_base(10));
        assert_eq!(swapped.swapped(), pair);
    }

    #[test]
    fn fresh_runtimes_start_cold_on_the_canonical_pair() {
        let runtime = SlotRuntime::new(30);
        assert_eq!(runtime.state, SlotState::Cold);
        assert_eq!(runtime.pair, LayerPair::canonical(30));
    }
}
