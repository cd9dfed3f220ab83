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

use clap::Parser;
use loopsync::{
    config::{Args, Config},
    drift::start_drift_controller,
    engine::SyncEngine,
    error::LoopSyncError,
    server::start_webserver,
    telemetry,
};
use miette::Result;
use std::time::Duration;
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    telemetry::init()?;

    let config = Config::load(&args.config).await?;

    info!("Starting loopsync on port {} …", args.port);

    let shutdown = CancellationToken::new();
    let (engine, status_rx) = SyncEngine::new(config, args.config.clone(), shutdown);
    let port = args.port;

    Toplevel::new(move |s| async move {
        engine.publish_idle().await;
        start_drift_controller(&s, engine.clone());
        start_webserver(&s, engine.clone(), status_rx, port);
        s.start(SubsystemBuilder::new("engine", move |s| async move {
            s.on_shutdown_requested().await;
            engine.close();
            Ok::<(), LoopSyncError>(())
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(5))
    .await?;

    Ok(())
}
