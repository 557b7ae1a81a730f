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

//! Handler wrapping another request handler with access logging

use async_trait::async_trait;
use log::debug;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use crate::configuration::{LogFormat, W3cLogConf};
use crate::error::{Error, SinkError};
use crate::service::{Handler, RequestHead, ResponseWriter};
use crate::shutdown::ShutdownCounter;
use crate::timer::ProvisionalTimer;
use crate::tracker::{
    date_time_fields, format_request_id, Finisher, LoggingResponse, RequestTracker,
};
use crate::writer::{fail_on_sink_error, W3cFormatWriter};

/// Logs every request passed on to the wrapped handler.
///
/// Each request produces exactly one terminal record. Requests still running after the
/// provisional log delay get an additional commented record so that long downloads show up in
/// the log right away, the terminal record then refers back to it by request identifier. If the
/// wrapped handler hijacks the connection, the terminal record is written once that connection
/// is closed.
#[derive(Debug)]
pub struct W3cLogHandler<H> {
    handler: H,
    format: LogFormat,
    writer: Arc<W3cFormatWriter>,
    shutdown: ShutdownCounter,
    provisional_log_delay: Duration,
    request_counter: AtomicU64,
    file_header: Once,
}

impl<H> W3cLogHandler<H> {
    /// Starts building a handler wrapping `handler`.
    pub fn builder(handler: H) -> W3cLogHandlerBuilder<H> {
        W3cLogHandlerBuilder {
            handler,
            format: LogFormat::default(),
            writer: None,
            shutdown: None,
            provisional_log_delay: Duration::from_secs(1),
        }
    }

    /// Creates a handler from configuration, opening the configured log file.
    pub fn from_conf(handler: H, conf: &W3cLogConf) -> Result<Self, Error> {
        Self::builder(handler)
            .format(conf.log_format)
            .log_writer(conf.open_log_file()?)
            .provisional_log_delay(conf.provisional_log_delay()?)
            .build()
    }

    /// The format of the log records
    pub fn format(&self) -> LogFormat {
        self.format
    }

    /// The counter tracking outstanding logging work of this handler
    pub fn shutdown_counter(&self) -> &ShutdownCounter {
        &self.shutdown
    }

    /// The writer receiving the log records
    pub fn format_writer(&self) -> &Arc<W3cFormatWriter> {
        &self.writer
    }

    /// Number of requests handled so far
    pub fn request_count(&self) -> u64 {
        self.request_counter.load(Ordering::SeqCst)
    }

    fn write_file_header(&self) {
        let [date, time] = date_time_fields();
        fail_on_sink_error(self.writer.write_comment("Version: 1.0"));
        fail_on_sink_error(self.writer.write_comment(&format!("Date: {date} {time}")));
        fail_on_sink_error(
            self.writer
                .write_comment(&format!("Fields: {}", self.format.fields())),
        );
    }

    /// Notes in the log that the server is up.
    pub fn started(&self) -> Result<(), SinkError> {
        self.writer.write_comment("Status: started")
    }

    /// Notes a server-level error in the log.
    pub fn log_error(&self, error: &str) -> Result<(), SinkError> {
        self.writer.write_comment(&format!("Error: {error}"))
    }

    /// Waits until all requests, provisional timers and hijacked connections are done.
    ///
    /// Requests aren’t aborted, this only makes sure that each of them has been logged before
    /// the caller exits.
    pub async fn shutdown(&self) -> Result<(), SinkError> {
        self.writer.write_comment("Status: shutting down")?;
        self.shutdown.wait().await;
        self.writer.write_comment("Status: shutdown complete")
    }
}

#[async_trait]
impl<H: Handler> Handler for W3cLogHandler<H> {
    async fn handle(&self, request: &RequestHead, response: &mut dyn ResponseWriter) {
        let id = self.request_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.file_header.call_once(|| self.write_file_header());

        let unit = self.shutdown.register();
        let tracker = Arc::new(RequestTracker::new(id, request));

        let timer = ProvisionalTimer::arm(self.provisional_log_delay, self.shutdown.register(), {
            let tracker = tracker.clone();
            let writer = self.writer.clone();
            move || {
                debug!(
                    "Request {} still in progress, writing provisional record",
                    format_request_id(tracker.id())
                );
                fail_on_sink_error(writer.write_commented(&tracker.provisional_fields()));
            }
        });

        let finisher = Finisher::new(tracker, self.writer.clone(), timer, unit);
        let mut logging_response = LoggingResponse::new(response, finisher, self.shutdown.clone());
        self.handler.handle(request, &mut logging_response).await;
        logging_response.finish();
    }
}

/// Builder for [`W3cLogHandler`]
#[derive(Debug)]
pub struct W3cLogHandlerBuilder<H> {
    handler: H,
    format: LogFormat,
    writer: Option<Arc<W3cFormatWriter>>,
    shutdown: Option<ShutdownCounter>,
    provisional_log_delay: Duration,
}

impl<H> W3cLogHandlerBuilder<H> {
    /// Selects the log format.
    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Writes the log to `sink`.
    pub fn log_writer(self, sink: impl Write + Send + 'static) -> Self {
        self.format_writer(Arc::new(W3cFormatWriter::new(sink)))
    }

    /// Writes the log via an existing writer, e.g. one shared with other handlers.
    pub fn format_writer(mut self, writer: Arc<W3cFormatWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Registers outstanding work with an existing counter instead of a new one.
    pub fn shutdown_counter(mut self, counter: ShutdownCounter) -> Self {
        self.shutdown = Some(counter);
        self
    }

    /// Sets the time after which requests still in progress get a provisional record, one
    /// second by default.
    pub fn provisional_log_delay(mut self, delay: Duration) -> Self {
        self.provisional_log_delay = delay;
        self
    }

    /// Creates the handler, a log writer has to be set.
    pub fn build(self) -> Result<W3cLogHandler<H>, Error> {
        let writer = self.writer.ok_or(Error::MissingLogWriter)?;

        Ok(W3cLogHandler {
            handler: self.handler,
            format: self.format,
            writer,
            shutdown: self.shutdown.unwrap_or_default(),
            provisional_log_delay: self.provisional_log_delay,
            request_counter: AtomicU64::new(0),
            file_header: Once::new(),
        })
    }
}
