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

//! The periodic control loop. While the mode is `Auto` it fires a drift
//! tick every `autosyncIntervalSec`. The interval is re-read every lap, so
//! config changes take effect on the next tick. Ticks run detached from
//! the timer; the engine's single-flight guard drops (and counts) a tick
//! that fires while the previous one is still busy.

use crate::{engine::SyncEngine, error::LoopSyncError, status::Mode};
use std::sync::Arc;
use tokio::{select, spawn, time::sleep};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::info;

pub fn start_drift_controller(subsys: &SubsystemHandle, engine: Arc<SyncEngine>) {
    info!("Starting drift controller subsystem");
    subsys.start(SubsystemBuilder::new("drift-controller", |subsys| {
        drift_controller(subsys, engine)
    }));
}

async fn drift_controller(
    subsys: SubsystemHandle,
    engine: Arc<SyncEngine>,
) -> Result<(), LoopSyncError> {
    info!("Drift controller started.");
    loop {
        let interval = engine.autosync_interval().await;
        select! {
            _ = sleep(interval) => {
                if engine.mode().await == Mode::Auto {
                    let engine = engine.clone();
                    spawn(async move { engine.drift_tick().await });
                }
            },
            _ = subsys.on_shutdown_requested() => break,
        }
    }
    info!("Drift controller stopped.");
    Ok(())
}
