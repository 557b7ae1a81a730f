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

//! # W3C Log Module for Pandora Web Server
//!
//! This crate wraps an HTTP request handler and writes an access log in a variant of the
//! [W3C Extended Log Format](https://www.w3.org/TR/WD-logfile.html). The log starts with a
//! header like the following, each request adds one line:
//!
//! ```text
//! #Version: 1.0
//! #Date: 2024-05-29 10:53:19
//! #Fields: date time c-ip cs-method cs-uri x-cs-protocol cs(User-Agent) cs(Range) sc-status bytes time-taken x-write-error x-async-association
//! 2024-05-29 10:53:19 192.0.2.3:52011 GET /movie.mkv HTTP/1.1 curl/8.5.0  200 2097152 0.050212  
//! ```
//!
//! Fields are separated by spaces. Fields containing spaces, quotation marks or line breaks are
//! put in quotation marks, with quotation marks inside doubled. [`parse_record`] reverses this.
//!
//! Requests taking longer than the provisional log delay (one second by default) are logged
//! twice. A commented record `#… -> 0x00000002` is written once the delay is over, the final
//! record then has `<- 0x00000002` in its `x-async-association` field.
//!
//! If the wrapped handler takes over the connection via [`ResponseWriter::hijack`], the status is
//! logged as `-1`. The record is written once the hijacked connection is shut down or dropped,
//! its byte count includes everything written to the connection.
//!
//! A configuration file could look like this:
//!
//! ```yaml
//! log_file: access.log
//! log_format: extended-legacy
//! provisional_log_delay: 1.0
//! ```
//!
//! The `log_file` and `provisional_log_delay` fields are also available as `--log-file` and
//! `--provisional-log-delay` command line options. A `log_file` value of `-` writes to standard
//! error.
//!
//! ## Code example
//!
//! ```rust
//! use async_trait::async_trait;
//! use http::StatusCode;
//! use w3c_log_module::{Handler, RequestHead, ResponseWriter, W3cLogConf, W3cLogHandler};
//!
//! #[derive(Debug)]
//! struct Hello;
//!
//! #[async_trait]
//! impl Handler for Hello {
//!     async fn handle(&self, _request: &RequestHead, response: &mut dyn ResponseWriter) {
//!         if response.write_header(StatusCode::OK).await.is_ok() {
//!             let _ = response.write_body(b"Hello, world!").await;
//!         }
//!     }
//! }
//!
//! let conf = W3cLogConf::from_yaml("log_file: '-'\nprovisional_log_delay: 2").unwrap();
//! let handler = W3cLogHandler::from_conf(Hello, &conf).unwrap();
//!
//! // Pass `handler` to the HTTP server. Before exiting, call `handler.shutdown().await` to make
//! // sure that all requests have been logged.
//! # drop(handler);
//! ```

pub mod configuration;
mod error;
mod handler;
mod hijack;
mod service;
mod shutdown;
mod timer;
mod tracker;
mod writer;

pub use configuration::{LogFormat, W3cLogConf, W3cLogOpt};
pub use error::{Error, HijackError, SinkError};
pub use handler::{W3cLogHandler, W3cLogHandlerBuilder};
pub use service::{Connection, Handler, Hijacked, RequestHead, ResponseWriter};
pub use shutdown::{ShutdownCounter, WorkUnit};
pub use writer::{parse_record, W3cFormatWriter};
