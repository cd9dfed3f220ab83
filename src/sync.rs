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

//! Pure batch planning for the cross-slot sync operations. The engine
//! snapshots the slots it wants to touch, this module turns them into
//! per-connection batches, and the engine dispatches those over the
//! channels.

use crate::{
    amcp::batch::{Batch, loadbg, mixer_opacity, mixer_volume, pause, play},
    slot::LayerPair,
    timecode::{Frames, slot_target_frame},
};

/// Immutable view of one effective slot, taken under the control-plane
/// lock before any network I/O happens.
#[derive(Debug, Clone)]
pub struct SlotPlan {
    pub id: u32,
    pub host: String,
    pub port: u16,
    pub channel: u32,
    pub pair: LayerPair,
    pub clip: String,
    pub tc_frames: Frames,
}

/// All slots of one sync operation that share a `(host, port)`.
#[derive(Debug, Clone)]
pub struct ConnectionPlan {
    pub host: String,
    pub port: u16,
    pub slots: Vec<SlotPlan>,
}

/// Groups slots by connection, keeping slot order within each group and
/// first-reference order across groups. Slots on different connections
/// never share a batch.
pub fn group_by_connection(plans: Vec<SlotPlan>) -> Vec<ConnectionPlan> {
    let mut groups: Vec<ConnectionPlan> = Vec::new();
    for plan in plans {
        match groups
            .iter_mut()
            .find(|g| g.host == plan.host && g.port == plan.port)
        {
            Some(group) => group.slots.push(plan),
            None => groups.push(ConnectionPlan {
                host: plan.host.clone(),
                port: plan.port,
                slots: vec![plan],
            }),
        }
    }
    groups
}

/// Both layers loaded at frame 0, paused, hidden, active at full volume.
pub fn preload_batch(slots: &[SlotPlan]) -> Batch {
    let mut batch = Batch::new();
    for slot in slots {
        for (layer, volume) in [(slot.pair.active, 1), (slot.pair.standby, 0)] {
            batch.push(loadbg(slot.channel, layer, &slot.clip, 0));
            batch.push(pause(slot.channel, layer));
            batch.push(mixer_opacity(slot.channel, layer, 0, 0));
            batch.push(mixer_volume(slot.channel, layer, volume, 0));
        }
    }
    batch
}

/// Both layers reloaded at the slot's start timecode, then the active one
/// starts playing and becomes visible.
pub fn start_batch(slots: &[SlotPlan]) -> Batch {
    let mut batch = Batch::new();
    for slot in slots {
        for layer in [slot.pair.active, slot.pair.standby] {
            batch.push(loadbg(slot.channel, layer, &slot.clip, slot.tc_frames));
        }
        for layer in [slot.pair.active, slot.pair.standby] {
            batch.push(pause(slot.channel, layer));
        }
        for layer in [slot.pair.active, slot.pair.standby] {
            batch.push(mixer_opacity(slot.channel, layer, 0, 0));
        }
        batch.push(mixer_volume(slot.channel, slot.pair.active, 1, 0));
        batch.push(mixer_volume(slot.channel, slot.pair.standby, 0, 0));
        batch.push(play(slot.channel, slot.pair.active));
        batch.push(mixer_opacity(slot.channel, slot.pair.active, 1, 0));
    }
    batch
}

pub fn pause_batch(slots: &[SlotPlan]) -> Batch {
    let mut batch = Batch::new();
    for slot in slots {
        batch.push(pause(slot.channel, slot.pair.active));
        batch.push(pause(slot.channel, slot.pair.standby));
    }
    batch
}

/// Phase 1 of a resync: park the standby layer on the target frame,
/// invisible and muted.
pub fn arm_batch(slots: &[SlotPlan], base_frame: Frames, loop_frames: Frames) -> Batch {
    let mut batch = Batch::new();
    for slot in slots {
        let target = slot_target_frame(base_frame, slot.tc_frames, loop_frames);
        batch.push(loadbg(slot.channel, slot.pair.standby, &slot.clip, target));
        batch.push(pause(slot.channel, slot.pair.standby));
        batch.push(mixer_opacity(slot.channel, slot.pair.standby, 0, 0));
        batch.push(mixer_volume(slot.channel, slot.pair.standby, 0, 0));
    }
    batch
}

/// Phase 2, CUT: swap visibility in one render cycle, then park the old
/// layer with the follow-up batch. The parking `PAUSE` must never share a
/// batch with the visibility swap.
pub fn cut_swap_batches(slot: &SlotPlan) -> (Batch, Batch) {
    let mut swap = Batch::new();
    swap.push(play(slot.channel, slot.pair.standby));
    swap.push(mixer_opacity(slot.channel, slot.pair.standby, 1, 0));
    swap.push(mixer_volume(slot.channel, slot.pair.standby, 1, 0));
    swap.push(mixer_opacity(slot.channel, slot.pair.active, 0, 0));
    swap.push(mixer_volume(slot.channel, slot.pair.active, 0, 0));

    let mut park = Batch::new();
    park.push(pause(slot.channel, slot.pair.active));

    (swap, park)
}

/// Phase 2, FADE: linear cross-fade over `fade_frames`, then park.
pub fn fade_swap_batches(slot: &SlotPlan, fade_frames: u32) -> (Batch, Batch) {
    let mut swap = Batch::new();
    swap.push(play(slot.channel, slot.pair.standby));
    swap.push(mixer_opacity(slot.channel, slot.pair.standby, 1, fade_frames));
    swap.push(mixer_volume(slot.channel, slot.pair.standby, 1, fade_frames));
    swap.push(mixer_opacity(slot.channel, slot.pair.active, 0, fade_frames));
    swap.push(mixer_volume(slot.channel, slot.pair.active, 0, fade_frames));

    let mut park = Batch::new();
    park.push(pause(slot.channel, slot.pair.active));

    (swap, park)
}

#[cfg(test)]
mod test {
    use super::*;

    fn plan(id: u32, host: &str, channel: u32, base_layer: u32) -> SlotPlan {
        SlotPlan {
            id,
            host: host.to_owned(),
            port: 5250,
            channel,
            pair: LayerPair::canonical(base_layer),
            clip: format!("clip{id}.mov"),
            tc_frames: 0,
        }
    }

    #[test]
    fn grouping_keeps_slot_order_and_never_mixes_connections() {
        let groups = group_by_connection(vec![
            plan(1, "a", 1, 10),
            plan(2, "b", 1, 10),
            plan(3, "a", 2, 10),
            plan(4, "a", 1, 30),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].host, "a");
        assert_eq!(
            groups[0].slots.iter().map(|s| s.id).collect::<Vec<_>>(),
            vec![1, 3, 4]
        );
        assert_eq!(groups[1].host, "b");
        assert_eq!(groups[1].slots.iter().map(|s| s.id).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn preload_batch_covers_both_layers_of_every_slot_in_order() {
        // three slots sharing one connection, channels 1, 1, 2
        let slots = vec![plan(1, "a", 1, 10), plan(2, "a", 1, 30), plan(3, "a", 2, 10)];
        let batch = preload_batch(&slots);

        let commands = batch.commands();
        let count = |prefix: &str| commands.iter().filter(|c| c.starts_with(prefix)).count();
        assert_eq!(count("LOADBG"), 6);
        assert_eq!(count("PAUSE"), 6);
        assert_eq!(count("MIXER"), 12);

        // slot order is preserved: all of slot 1's commands come before slot 2's
        let last_slot1 = commands
            .iter()
            .rposition(|c| c.contains("clip1.mov") || c.contains("1-10") || c.contains("1-20"))
            .unwrap();
        let first_slot2 = commands
            .iter()
            .position(|c| c.contains("clip2.mov") || c.contains("1-30") || c.contains("1-40"))
            .unwrap();
        assert!(last_slot1 < first_slot2);

        // envelope framing
        let wire = batch.envelope();
        assert_eq!(wire.first().unwrap(), "DEFER");
        assert_eq!(wire.last().unwrap(), "RESUME");
        assert_eq!(wire.len(), 26);
    }

    #[test]
    fn preload_batch_hides_both_layers_and_mutes_the_standby() {
        let batch = preload_batch(&[plan(1, "a", 1, 10)]);
        let commands = batch.commands();
        assert!(commands.contains(&"MIXER 1-10 OPACITY 0 0".to_owned()));
        assert!(commands.contains(&"MIXER 1-20 OPACITY 0 0".to_owned()));
        assert!(commands.contains(&"MIXER 1-10 VOLUME 1 0".to_owned()));
        assert!(commands.contains(&"MIXER 1-20 VOLUME 0 0".to_owned()));
    }

    #[test]
    fn start_batch_loads_at_the_start_timecode_and_reveals_the_active_layer() {
        let mut slot = plan(1, "a", 1, 10);
        slot.tc_frames = 10205;
        let batch = start_batch(&[slot]);
        let commands = batch.commands();
        assert_eq!(commands[0], "LOADBG 1-10 \"clip1.mov\" SEEK 10205 LOOP");
        assert_eq!(commands[1], "LOADBG 1-20 \"clip1.mov\" SEEK 10205 LOOP");
        assert_eq!(commands.last().unwrap(), "MIXER 1-10 OPACITY 1 0");
        assert!(commands.contains(&"PLAY 1-10".to_owned()));
        // the play comes after both pauses
        let play_pos = commands.iter().position(|c| c == "PLAY 1-10").unwrap();
        let pause_pos = commands.iter().rposition(|c| c.starts_with("PAUSE")).unwrap();
        assert!(pause_pos < play_pos);
    }

    #[test]
    fn arm_batch_targets_the_standby_layer_only() {
        let mut slot = plan(1, "a", 1, 10);
        slot.tc_frames = 100;
        let batch = arm_batch(&[slot], 25000, 30000);
        assert_eq!(
            batch.commands(),
            &[
                "LOADBG 1-20 \"clip1.mov\" SEEK 25100 LOOP",
                "PAUSE 1-20",
                "MIXER 1-20 OPACITY 0 0",
                "MIXER 1-20 VOLUME 0 0",
            ]
        );
    }

    #[test]
    fn arm_batch_wraps_the_target_at_the_loop_boundary() {
        let mut slot = plan(1, "a", 1, 10);
        slot.tc_frames = 10000;
        let batch = arm_batch(&[slot], 25000, 30000);
        assert_eq!(
            batch.commands()[0],
            "LOADBG 1-20 \"clip1.mov\" SEEK 5000 LOOP"
        );
    }

    #[test]
    fn cut_swap_keeps_the_parking_pause_out_of_the_swap_batch() {
        let (swap, park) = cut_swap_batches(&plan(1, "a", 1, 10));
        assert_eq!(
            swap.commands(),
            &[
                "PLAY 1-20",
                "MIXER 1-20 OPACITY 1 0",
                "MIXER 1-20 VOLUME 1 0",
                "MIXER 1-10 OPACITY 0 0",
                "MIXER 1-10 VOLUME 0 0",
            ]
        );
        assert!(!swap.commands().iter().any(|c| c.starts_with("PAUSE")));
        assert_eq!(park.commands(), &["PAUSE 1-10"]);
    }

    #[test]
    fn fade_swap_ramps_linearly_over_the_fade_length() {
        let (swap, park) = fade_swap_batches(&plan(1, "a", 1, 10), 4);
        assert_eq!(
            swap.commands(),
            &[
                "PLAY 1-20",
                "MIXER 1-20 OPACITY 1 4 LINEAR",
                "MIXER 1-20 VOLUME 1 4 LINEAR",
                "MIXER 1-10 OPACITY 0 4 LINEAR",
                "MIXER 1-10 VOLUME 0 4 LINEAR",
            ]
        );
        assert_eq!(park.commands(), &["PAUSE 1-10"]);
    }

    #[test]
    fn swap_batches_follow_the_current_pair_roles() {
        // after one resync the roles are reversed
        let mut slot = plan(1, "a", 1, 10);
        slot.pair = slot.pair.swapped();
        let (swap, _) = cut_swap_batches(&slot);
        assert_eq!(swap.commands()[0], "PLAY 1-10");
    }

    #[test]
    fn pause_batch_pauses_both_layers() {
        let batch = pause_batch(&[plan(1, "a", 1, 10)]);
        assert_eq!(batch.commands(), &["PAUSE 1-10", "PAUSE 1-20"]);
    }
}
