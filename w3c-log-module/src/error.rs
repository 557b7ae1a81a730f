// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error types of the module

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors preventing the access log handler from being installed
#[derive(Debug, Error)]
pub enum Error {
    /// The requested log format isn’t implemented
    #[error("unsupported log format: {0}")]
    UnsupportedFormat(String),

    /// The handler was built without a destination for the log
    #[error("a log writer must be specified")]
    MissingLogWriter,

    /// The configured log file could not be opened
    #[error("failed opening log file {}: {source}", path.display())]
    OpenLogFile {
        /// Path of the log file
        path: PathBuf,
        /// Underlying I/O error
        source: io::Error,
    },

    /// Configuration could not be parsed or contains invalid values
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Failure writing a record to the line sink
///
/// A broken sink means the access trail is being lost, callers treat this as fatal.
#[derive(Debug, Error)]
#[error("failed writing to access log: {0}")]
pub struct SinkError(#[from] pub io::Error);

/// Errors returned when a handler attempts to take over the connection
#[derive(Debug, Error)]
pub enum HijackError {
    /// The underlying response doesn’t give access to its transport
    #[error("connection hijacking not supported")]
    NotSupported,

    /// The connection has been hijacked already
    #[error("connection already hijacked")]
    AlreadyHijacked,

    /// The transport failed while being taken over
    #[error("connection hijacking failed: {0}")]
    Io(#[from] io::Error),
}
