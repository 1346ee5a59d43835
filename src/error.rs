/*
 * Copyright (C) 2026 Gantry contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Crate-wide error taxonomy.
//!
//! Cancellation-shaped failures are normalized into [`Error::Aborted`] by
//! the helpers in [`crate::abort`] before they reach the operation envelope,
//! so downstream code only ever branches on aborted vs. everything else.

use crate::abort::AbortReason;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All failure classes the bridge distinguishes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request payload was malformed or missing a required field.
    #[error("validation error: {0}")]
    Validation(String),

    /// The work was cancelled, explicitly or by timeout.
    #[error("{0}")]
    Aborted(AbortReason),

    /// The upstream MAAS API returned an error or was unreachable.
    #[error("upstream error: {message}")]
    Upstream {
        /// HTTP status from the upstream response, when one was received.
        status: Option<u16>,
        /// Human-readable description of the failure.
        message: String,
    },

    /// A referenced machine, operation, or resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Anything unclassified.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Builds a [`Error::Validation`] from anything stringy.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Builds a [`Error::Upstream`] without an HTTP status.
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            status: None,
            message: message.into(),
        }
    }

    /// Builds a [`Error::Upstream`] carrying the HTTP status code.
    pub fn upstream_status(status: u16, message: impl Into<String>) -> Self {
        Self::Upstream {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Builds a [`Error::NotFound`] from anything stringy.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(e.into())
    }
}
