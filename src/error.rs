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

use axum::{Json, http::StatusCode, response::IntoResponse};
use miette::Diagnostic;
use serde_json::json;
use std::{fmt::Display, io, path::PathBuf};
use thiserror::Error;
use tracing_subscriber::util::TryInitError;

#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not write config file {path}: {source}")]
    Unwritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed config file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors on a single remote engine connection. `Remote` leaves the
/// connection alone, `Network` and `Protocol` force a reconnect.
#[derive(Error, Debug, Diagnostic, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("network error: {0}")]
    Network(String),
    #[error("remote error {code}: {message}")]
    Remote { code: u16, message: String },
    #[error("malformed reply: {0}")]
    Protocol(String),
    #[error("connection is shutting down")]
    Closed,
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        ChannelError::Network(e.to_string())
    }
}

pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Error, Debug, Clone)]
#[error("slot {slot}: {error}")]
pub struct SlotFailure {
    pub slot: u32,
    pub error: ChannelError,
}

/// Aggregate result of a sync operation. One connection's failure never
/// aborts the others, so every affected slot shows up here.
#[derive(Debug, Diagnostic, Clone)]
pub struct SyncFailure {
    pub failures: Vec<SlotFailure>,
}

impl Display for SyncFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for failure in &self.failures {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{failure}")?;
            first = false;
        }
        Ok(())
    }
}

impl std::error::Error for SyncFailure {}

pub type SyncResult = Result<(), SyncFailure>;

#[derive(Error, Debug, Diagnostic)]
pub enum LoopSyncError {
    #[error("config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON serde error: {0}")]
    JsonSerdeError(#[from] serde_json::Error),
    #[error("tracing init error: {0}")]
    TryInitError(#[from] TryInitError),
}

pub type LoopSyncResult<T> = Result<T, LoopSyncError>;

/// Error shape of the control surface. Everything the HTTP handlers can
/// fail with maps to an `{ok:false, error}` body and a 4xx/5xx status.
#[derive(Error, Debug, Diagnostic)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Sync(#[from] SyncFailure),
    #[error("{0}")]
    Internal(String),
}

impl From<ConfigError> for ApiError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::InvalidField { .. } => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Sync(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = match &self {
            ApiError::Sync(failure) => json!({
                "ok": false,
                "error": failure.to_string(),
                "failures": failure
                    .failures
                    .iter()
                    .map(|f| json!({"slot": f.slot, "error": f.error.to_string()}))
                    .collect::<Vec<_>>(),
            }),
            other => json!({"ok": false, "error": other.to_string()}),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
