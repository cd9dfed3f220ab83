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

//! The controller value that owns all mutable state: config, mode, the
//! logical clock and every slot's layer pair. Sync operations snapshot the
//! state under the control-plane lock, release it, dispatch batches in
//! parallel across connections and re-acquire the lock to record the
//! outcome. Pair swaps only happen after the owning connection completed
//! the transaction.

use crate::{
    amcp::{
        batch::{Batch, call_frame},
        channel::AmcpChannel,
    },
    config::{Config, ConfigPatch, ResyncMode},
    error::{ConfigResult, SlotFailure, SyncFailure, SyncResult},
    slot::{SlotRuntime, SlotState},
    status::{Mode, StatusRow, StatusSnapshot},
    sync::{
        ConnectionPlan, SlotPlan, arm_batch, cut_swap_batches, fade_swap_batches,
        group_by_connection, pause_batch, preload_batch, start_batch,
    },
    timecode::{Frames, elapsed_frames, parse_tc, slot_target_frame, wrap_frame},
};
use futures::future::join_all;
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::{Mutex, watch},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub struct SyncEngine {
    state: Mutex<EngineState>,
    channels: Mutex<HashMap<(String, u16), AmcpChannel>>,
    status_tx: watch::Sender<StatusSnapshot>,
    dropped_ticks: AtomicU64,
    tick_running: AtomicBool,
    config_path: PathBuf,
    shutdown: CancellationToken,
}

struct EngineState {
    config: Config,
    mode: Mode,
    t0: Option<Instant>,
    slots: HashMap<u32, SlotRuntime>,
}

impl EngineState {
    /// Snapshots every effective slot whose runtime passes `filter`, in
    /// slot index order. Runtimes are created on first reference.
    fn effective_plans(&mut self, filter: impl Fn(&SlotRuntime) -> bool) -> Vec<SlotPlan> {
        let fps = self.config.fps;
        let mut plans = Vec::new();
        for slot in self.config.slots.iter().filter(|s| s.is_effective()) {
            let runtime = self
                .slots
                .entry(slot.id)
                .or_insert_with(|| SlotRuntime::new(slot.base_layer));
            if !filter(runtime) {
                continue;
            }
            plans.push(SlotPlan {
                id: slot.id,
                host: slot.host.clone(),
                port: slot.port,
                channel: slot.channel,
                pair: runtime.pair,
                clip: slot.clip.clone(),
                tc_frames: parse_tc(&slot.start_timecode, fps),
            });
        }
        plans.sort_by_key(|p| p.id);
        plans
    }

    /// Shared base frame at this instant, 0 before the first start.
    fn base_frame(&self) -> Frames {
        match self.t0 {
            Some(t0) => wrap_frame(
                elapsed_frames(t0, Instant::now(), self.config.fps),
                self.config.frames,
            ),
            None => 0,
        }
    }
}

impl SyncEngine {
    pub fn new(
        config: Config,
        config_path: PathBuf,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, watch::Receiver<StatusSnapshot>) {
        let (status_tx, status_rx) = watch::channel(StatusSnapshot::default());
        let engine = Arc::new(SyncEngine {
            state: Mutex::new(EngineState {
                config,
                mode: Mode::Off,
                t0: None,
                slots: HashMap::new(),
            }),
            channels: Mutex::new(HashMap::new()),
            status_tx,
            dropped_ticks: AtomicU64::new(0),
            tick_running: AtomicBool::new(false),
            config_path,
            shutdown,
        });
        (engine, status_rx)
    }

    /// Loads both layers of every effective slot at frame 0, hidden and
    /// paused.
    #[instrument(skip(self))]
    pub async fn preload_all(&self) -> SyncResult {
        let plans = self.state.lock().await.effective_plans(|_| true);
        if plans.is_empty() {
            return Ok(());
        }
        info!("Preloading {} slot(s) …", plans.len());
        let (ok_slots, failures) = self
            .dispatch(group_by_connection(plans), preload_batch)
            .await;
        self.mark_slots(&ok_slots, SlotState::Preloaded).await;
        self.publish_idle().await;
        finish(failures)
    }

    /// Restarts the logical clock and all effective slots. `t0` is captured
    /// before any command goes out so drift is measured against the instant
    /// of start, and every pair is reset to its canonical roles.
    #[instrument(skip(self))]
    pub async fn start_all(&self) -> SyncResult {
        let plans = {
            let mut state = self.state.lock().await;
            state.t0 = Some(Instant::now());
            let bases: Vec<(u32, u32)> = state
                .config
                .slots
                .iter()
                .filter(|s| s.is_effective())
                .map(|s| (s.id, s.base_layer))
                .collect();
            for (id, base_layer) in bases {
                state.slots.insert(id, SlotRuntime::new(base_layer));
            }
            state.effective_plans(|_| true)
        };
        if plans.is_empty() {
            self.publish_idle().await;
            return Ok(());
        }
        info!("Starting {} slot(s) …", plans.len());
        let (ok_slots, failures) = self.dispatch(group_by_connection(plans), start_batch).await;
        self.mark_slots(&ok_slots, SlotState::Playing).await;
        self.publish_idle().await;
        finish(failures)
    }

    /// Pauses both layers of every slot that is currently playing. Does not
    /// touch the logical clock.
    #[instrument(skip(self))]
    pub async fn pause_all(&self) -> SyncResult {
        let plans = self
            .state
            .lock()
            .await
            .effective_plans(|rt| matches!(rt.state, SlotState::Playing | SlotState::Paused));
        if plans.is_empty() {
            return Ok(());
        }
        info!("Pausing {} slot(s) …", plans.len());
        let (ok_slots, failures) = self.dispatch(group_by_connection(plans), pause_batch).await;
        self.mark_slots(&ok_slots, SlotState::Paused).await;
        self.publish_idle().await;
        finish(failures)
    }

    /// Re-aligns every playing slot to the target frame with a dual-layer
    /// swap. A no-op while nothing is playing.
    ///
    /// Phase 1 arms the standby layers, one batch per connection. Phase 2
    /// runs the two-batch visibility transition per slot, connections in
    /// parallel, slots on one connection in index order. A slot's pair
    /// swaps only after both of its batches succeeded.
    #[instrument(skip(self))]
    pub async fn resync_all(
        &self,
        mode: Option<ResyncMode>,
        frame: Option<Frames>,
    ) -> SyncResult {
        let (plans, mode, fade_frames, post_fade_delay, loop_frames, base) = {
            let mut state = self.state.lock().await;
            let plans = state.effective_plans(|rt| rt.state == SlotState::Playing);
            if plans.is_empty() {
                return Ok(());
            }
            (
                plans,
                mode.unwrap_or(state.config.resync_mode),
                state.config.fade_frames,
                state.config.post_fade_delay(),
                state.config.frames,
                frame.unwrap_or_else(|| state.base_frame()),
            )
        };
        info!(
            "Resyncing {} slot(s) to base frame {base} ({mode:?}) …",
            plans.len()
        );

        let jobs = self.with_channels(group_by_connection(plans)).await;

        // phase 1: arm all standby layers
        let armed = join_all(jobs.into_iter().map(|(group, channel)| async move {
            let result = channel
                .send(arm_batch(&group.slots, base, loop_frames).envelope())
                .await;
            (group, channel, result)
        }))
        .await;

        let mut failures = Vec::new();
        let mut swap_jobs = Vec::new();
        for (group, channel, result) in armed {
            match result {
                Ok(_) => swap_jobs.push((group, channel)),
                Err(e) => failures.extend(
                    group
                        .slots
                        .iter()
                        .map(|s| SlotFailure { slot: s.id, error: e.clone() }),
                ),
            }
        }

        // phase 2: visibility swaps
        let swapped = join_all(swap_jobs.into_iter().map(|(group, channel)| async move {
            let mut swapped = Vec::new();
            let mut failed = Vec::new();
            for slot in &group.slots {
                let (swap, park) = match mode {
                    ResyncMode::Cut => cut_swap_batches(slot),
                    ResyncMode::Fade => fade_swap_batches(slot, fade_frames),
                };
                match channel.send(swap.envelope()).await {
                    Ok(_) => {
                        if mode == ResyncMode::Fade {
                            sleep(post_fade_delay).await;
                        }
                        match channel.send(park.envelope()).await {
                            Ok(_) => swapped.push(slot.id),
                            Err(e) => failed.push(SlotFailure { slot: slot.id, error: e }),
                        }
                    }
                    Err(e) => failed.push(SlotFailure { slot: slot.id, error: e }),
                }
            }
            (swapped, failed)
        }))
        .await;

        let mut swapped_ids = Vec::new();
        for (ids, failed) in swapped {
            swapped_ids.extend(ids);
            failures.extend(failed);
        }

        {
            let mut state = self.state.lock().await;
            for id in &swapped_ids {
                if let Some(runtime) = state.slots.get_mut(id) {
                    runtime.pair = runtime.pair.swapped();
                }
            }
        }
        self.publish_idle().await;
        finish(failures)
    }

    /// One drift-controller tick. Single-flight: if the previous tick is
    /// still running this one is dropped and counted, never queued.
    pub async fn drift_tick(&self) {
        if self.tick_running.swap(true, Ordering::SeqCst) {
            self.dropped_ticks.fetch_add(1, Ordering::Relaxed);
            warn!("Previous drift tick still running, dropping this one.");
            return;
        }
        self.run_tick().await;
        self.tick_running.store(false, Ordering::SeqCst);
    }

    async fn run_tick(&self) {
        let (plans, base, loop_frames, tolerance, resync_mode) = {
            let mut state = self.state.lock().await;
            if state.mode != Mode::Auto {
                return;
            }
            (
                state.effective_plans(|_| true),
                state.base_frame(),
                state.config.frames,
                state.config.drift_tolerance_frames,
                state.config.resync_mode,
            )
        };

        let samples = self.sample_frames(&plans).await;

        // raw signed deltas; a wrap near the loop boundary looks like
        // catastrophic drift and warrants a resync anyway
        let exceeded = plans.iter().any(|plan| {
            let target = slot_target_frame(base, plan.tc_frames, loop_frames);
            match samples.get(&plan.id) {
                Some(current) => (current - target).abs() > tolerance,
                None => false,
            }
        });

        self.publish_sampled(&samples).await;

        if exceeded {
            // the mode may have left AUTO while we were sampling
            if self.mode().await != Mode::Auto {
                return;
            }
            info!("Drift exceeds tolerance of {tolerance} frame(s), resyncing …");
            if let Err(e) = self.resync_all(Some(resync_mode), Some(base)).await {
                warn!("Automatic resync failed: {e}");
            }
        }
    }

    /// Queries every slot's active layer for its current frame. Parallel
    /// across connections, serial within each. Slots whose reply is missing
    /// or unparseable are absent from the result.
    async fn sample_frames(&self, plans: &[SlotPlan]) -> HashMap<u32, Frames> {
        let jobs = self.with_channels(group_by_connection(plans.to_vec())).await;
        let results = join_all(jobs.into_iter().map(|(group, channel)| async move {
            let mut samples = Vec::new();
            for slot in &group.slots {
                match channel
                    .send(vec![call_frame(slot.channel, slot.pair.active)])
                    .await
                {
                    Ok(replies) => {
                        if let Some(frame) = replies.first().and_then(|r| r.frame()) {
                            samples.push((slot.id, frame));
                        }
                    }
                    Err(e) => debug!("Could not sample slot {}: {e}", slot.id),
                }
            }
            samples
        }))
        .await;
        results.into_iter().flatten().collect()
    }

    pub async fn mode(&self) -> Mode {
        self.state.lock().await.mode
    }

    pub async fn set_mode(&self, mode: Mode) {
        self.state.lock().await.mode = mode;
        info!("Mode set to {mode:?}.");
        self.publish_idle().await;
    }

    pub async fn reset_clock(&self) {
        self.state.lock().await.t0 = Some(Instant::now());
        info!("Logical clock reset.");
        self.publish_idle().await;
    }

    pub async fn config(&self) -> Config {
        self.state.lock().await.config.clone()
    }

    pub async fn autosync_interval(&self) -> Duration {
        self.state.lock().await.config.autosync_interval()
    }

    /// Applies a partial config update, persists it and reconciles runtime
    /// state: pairs reset to canonical where the base layer changed,
    /// runtimes of vanished slots dropped, unreferenced connections closed.
    pub async fn update_config(&self, patch: ConfigPatch) -> ConfigResult<()> {
        let new_config = {
            let mut state = self.state.lock().await;
            let new_config = state.config.merged(patch)?;
            let mut keep = HashMap::new();
            for slot in &new_config.slots {
                if let Some(runtime) = state.slots.get(&slot.id) {
                    if runtime.pair.matches_base(slot.base_layer) {
                        keep.insert(slot.id, *runtime);
                    }
                }
            }
            state.slots = keep;
            state.config = new_config.clone();
            new_config
        };

        let live: HashSet<(String, u16)> = new_config
            .slots
            .iter()
            .filter(|s| s.is_effective())
            .map(|s| (s.host.clone(), s.port))
            .collect();
        {
            let mut channels = self.channels.lock().await;
            channels.retain(|key, channel| {
                let keep = live.contains(key);
                if !keep {
                    info!("Closing connection to {}:{} …", key.0, key.1);
                    channel.close();
                }
                keep
            });
        }

        new_config.save(&self.config_path).await?;
        self.publish_idle().await;
        Ok(())
    }

    pub fn dropped_ticks(&self) -> u64 {
        self.dropped_ticks.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Publishes a snapshot without per-slot samples; `currentFrame` and
    /// `drift` are null.
    pub async fn publish_idle(&self) {
        let snapshot = self.build_snapshot(&HashMap::new(), false).await;
        self.status_tx.send_replace(snapshot);
    }

    async fn publish_sampled(&self, samples: &HashMap<u32, Frames>) {
        let snapshot = self.build_snapshot(samples, true).await;
        self.status_tx.send_replace(snapshot);
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        self.status_tx.borrow().clone()
    }

    async fn build_snapshot(
        &self,
        samples: &HashMap<u32, Frames>,
        sampled: bool,
    ) -> StatusSnapshot {
        let (mut snapshot, endpoints) = {
            let state = self.state.lock().await;
            let now = Instant::now();
            let base = state.base_frame();
            let mut rows = Vec::new();
            let mut endpoints = Vec::new();
            for slot in state.config.slots.iter().filter(|s| s.is_effective()) {
                let runtime = state
                    .slots
                    .get(&slot.id)
                    .copied()
                    .unwrap_or_else(|| SlotRuntime::new(slot.base_layer));
                let tc_frames = parse_tc(&slot.start_timecode, state.config.fps);
                let target_frame = slot_target_frame(base, tc_frames, state.config.frames);
                let current_frame = if sampled {
                    samples.get(&slot.id).copied()
                } else {
                    None
                };
                endpoints.push((slot.host.clone(), slot.port));
                rows.push(StatusRow {
                    index: slot.id,
                    name: slot.name.clone(),
                    host: slot.host.clone(),
                    port: slot.port,
                    channel: slot.channel,
                    base_layer: slot.base_layer,
                    active_layer: runtime.pair.active,
                    standby_layer: runtime.pair.standby,
                    clip: slot.clip.clone(),
                    timecode: slot.start_timecode.clone(),
                    state: runtime.state,
                    connected: false,
                    current_frame,
                    target_frame,
                    drift: current_frame.map(|c| c - target_frame),
                });
            }
            let snapshot = StatusSnapshot {
                mode: state.mode,
                resync_mode: state.config.resync_mode,
                fade_frames: state.config.fade_frames,
                t0: state.t0.map(|t0| now.duration_since(t0).as_millis() as u64),
                fps: state.config.fps,
                frames: state.config.frames,
                autosync_interval_sec: state.config.autosync_interval_sec,
                drift_tolerance_frames: state.config.drift_tolerance_frames,
                slot_capacity: crate::config::SLOT_CAPACITY,
                dropped_ticks: self.dropped_ticks(),
                rows,
            };
            (snapshot, endpoints)
        };

        let channels = self.channels.lock().await;
        for (row, (host, port)) in snapshot.rows.iter_mut().zip(endpoints) {
            row.connected = channels
                .get(&(host, port))
                .map(|c| c.connected())
                .unwrap_or(false);
        }
        snapshot
    }

    async fn channel(&self, host: &str, port: u16) -> AmcpChannel {
        let options = self.state.lock().await.config.socket.clone();
        let mut channels = self.channels.lock().await;
        channels
            .entry((host.to_owned(), port))
            .or_insert_with(|| {
                AmcpChannel::connect(host.to_owned(), port, options, &self.shutdown)
            })
            .clone()
    }

    async fn with_channels(
        &self,
        groups: Vec<ConnectionPlan>,
    ) -> Vec<(ConnectionPlan, AmcpChannel)> {
        let mut jobs = Vec::with_capacity(groups.len());
        for group in groups {
            let channel = self.channel(&group.host, group.port).await;
            jobs.push((group, channel));
        }
        jobs
    }

    /// Sends one batch per connection in parallel and reports which slots
    /// were covered by a successful one.
    async fn dispatch(
        &self,
        groups: Vec<ConnectionPlan>,
        build: fn(&[SlotPlan]) -> Batch,
    ) -> (Vec<u32>, Vec<SlotFailure>) {
        let jobs = self.with_channels(groups).await;
        let results = join_all(jobs.into_iter().map(|(group, channel)| async move {
            let result = channel.send(build(&group.slots).envelope()).await;
            (group, result)
        }))
        .await;

        let mut ok_slots = Vec::new();
        let mut failures = Vec::new();
        for (group, result) in results {
            match result {
                Ok(_) => ok_slots.extend(group.slots.iter().map(|s| s.id)),
                Err(e) => failures.extend(
                    group
                        .slots
                        .iter()
                        .map(|s| SlotFailure { slot: s.id, error: e.clone() }),
                ),
            }
        }
        (ok_slots, failures)
    }

    async fn mark_slots(&self, ids: &[u32], new_state: SlotState) {
        let mut state = self.state.lock().await;
        for id in ids {
            if let Some(runtime) = state.slots.get_mut(id) {
                runtime.state = new_state;
            }
        }
    }
}

fn finish(failures: Vec<SlotFailure>) -> SyncResult {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(SyncFailure { failures })
    }
}
