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

//! Data structures required for `W3cLogHandler` configuration

use clap::Parser;
use log::trace;
use serde::Deserialize;
use std::fmt::Display;
use std::fs::File;
use std::io::{stderr, BufReader, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;

/// Log formats the handler can produce
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum LogFormat {
    /// W3C Extended Log Format with the fixed field list
    /// `date time c-ip cs-method cs-uri x-cs-protocol cs(User-Agent) cs(Range) sc-status bytes
    /// time-taken x-write-error x-async-association`, `extended-legacy` in config file
    #[default]
    ExtendedLegacy,
}

impl LogFormat {
    /// Field list announced in the `#Fields:` header line
    pub fn fields(self) -> &'static str {
        match self {
            Self::ExtendedLegacy => {
                "date time c-ip cs-method cs-uri x-cs-protocol cs(User-Agent) cs(Range) \
                 sc-status bytes time-taken x-write-error x-async-association"
            }
        }
    }
}

impl Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExtendedLegacy => f.write_str("extended-legacy"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "extended-legacy" => Ok(Self::ExtendedLegacy),
            other => Err(Error::UnsupportedFormat(other.to_owned())),
        }
    }
}

impl TryFrom<String> for LogFormat {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Command line options of the W3C log module
#[derive(Debug, Default, Parser)]
pub struct W3cLogOpt {
    /// Access log file path. The special value - writes to standard error.
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    /// Seconds after which a request still in progress gets a provisional log record.
    #[clap(long)]
    pub provisional_log_delay: Option<f64>,
}

/// Configuration file settings of the W3C log module
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct W3cLogConf {
    /// Access log file path. The special value `-` writes to standard error.
    pub log_file: PathBuf,

    /// Log format, only `extended-legacy` is currently supported.
    pub log_format: LogFormat,

    /// Seconds after which a request still in progress gets a provisional log record.
    pub provisional_log_delay: f64,
}

impl Default for W3cLogConf {
    fn default() -> Self {
        Self {
            log_file: PathBuf::from("-"),
            log_format: LogFormat::default(),
            provisional_log_delay: 1.0,
        }
    }
}

impl W3cLogConf {
    /// Parses configuration from YAML text.
    pub fn from_yaml(text: impl AsRef<str>) -> Result<Self, Error> {
        serde_yaml::from_str(text.as_ref()).map_err(|err| Error::Config(err.to_string()))
    }

    /// Loads configuration from a YAML file.
    pub fn load_from_yaml(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| {
            Error::Config(format!(
                "failed opening configuration file {}: {err}",
                path.display()
            ))
        })?;
        let conf: Self = serde_yaml::from_reader(BufReader::new(file))
            .map_err(|err| Error::Config(err.to_string()))?;
        trace!("Loaded configuration file: {conf:#?}");
        Ok(conf)
    }

    /// Merges the command line options into the current configuration. Any command line options
    /// present overwrite existing settings.
    pub fn merge_with_opt(&mut self, opt: W3cLogOpt) {
        if let Some(log_file) = opt.log_file {
            self.log_file = log_file;
        }

        if let Some(delay) = opt.provisional_log_delay {
            self.provisional_log_delay = delay;
        }
    }

    /// Validated provisional log delay
    pub fn provisional_log_delay(&self) -> Result<Duration, Error> {
        Duration::try_from_secs_f64(self.provisional_log_delay).map_err(|_| {
            Error::Config(format!(
                "provisional_log_delay has to be a non-negative number of seconds, got {}",
                self.provisional_log_delay
            ))
        })
    }

    /// Opens the configured line sink, appending to the log file if it exists already.
    pub fn open_log_file(&self) -> Result<Box<dyn Write + Send>, Error> {
        if self.log_file.as_os_str() == "-" {
            return Ok(Box::new(stderr()));
        }

        let file = File::options()
            .append(true)
            .create(true)
            .open(&self.log_file)
            .map_err(|source| Error::OpenLogFile {
                path: self.log_file.clone(),
                source,
            })?;
        Ok(Box::new(file))
    }
}
