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

//! Tracks the state of a single request and proxies its response

use async_trait::async_trait;
use chrono::Local;
use http::{header, HeaderMap, StatusCode};
use log::{debug, warn};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::time::Instant;

use crate::error::HijackError;
use crate::hijack::{CloseLatch, HijackedConnection};
use crate::service::{Hijacked, RequestHead, ResponseWriter};
use crate::shutdown::{ShutdownCounter, WorkUnit};
use crate::timer::{Disarm, ProvisionalTimer};
use crate::writer::{fail_on_sink_error, W3cFormatWriter};

/// Status logged for connections taken over by the handler, never a valid HTTP status
pub(crate) const HIJACKED_STATUS: i32 = -1;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

pub(crate) fn format_request_id(id: u64) -> String {
    format!("0x{id:08x}")
}

/// Current date and time fields as used at the start of each record
pub(crate) fn date_time_fields() -> [String; 2] {
    let now = Local::now();
    [
        now.format(DATE_FORMAT).to_string(),
        now.format(TIME_FORMAT).to_string(),
    ]
}

/// Per-request state, shared between the request task, its provisional timer and possibly a
/// hijacked connection.
#[derive(Debug)]
pub(crate) struct RequestTracker {
    id: u64,
    remote_addr: String,
    method: String,
    uri: String,
    protocol: String,
    user_agent: String,
    range: String,
    started: Instant,

    status: AtomicI32,
    header_sent: AtomicBool,
    written: AtomicU64,
    write_error: OnceLock<String>,
    hijacked: AtomicBool,
}

impl RequestTracker {
    pub(crate) fn new(id: u64, request: &RequestHead) -> Self {
        Self {
            id,
            remote_addr: request
                .remote_addr
                .map(|addr| addr.to_string())
                .unwrap_or_default(),
            method: request.method.to_string(),
            uri: request.uri.to_string(),
            protocol: format!("{:?}", request.version),
            user_agent: request.header_str(header::USER_AGENT),
            range: request.header_str(header::RANGE),
            started: Instant::now(),

            status: AtomicI32::new(StatusCode::OK.as_u16().into()),
            header_sent: AtomicBool::new(false),
            written: AtomicU64::new(0),
            write_error: OnceLock::new(),
            hijacked: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn status(&self) -> i32 {
        self.status.load(Ordering::Acquire)
    }

    pub(crate) fn written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    pub(crate) fn is_hijacked(&self) -> bool {
        self.hijacked.load(Ordering::Acquire)
    }

    /// Records the status unless headers have been sent already.
    fn record_status(&self, status: StatusCode) {
        if !self.header_sent.swap(true, Ordering::AcqRel) {
            self.status.store(status.as_u16().into(), Ordering::Release);
        }
    }

    fn mark_header_sent(&self) {
        self.header_sent.store(true, Ordering::Release);
    }

    pub(crate) fn add_written(&self, bytes: u64) {
        self.written.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Keeps the first error, later ones are discarded.
    fn record_error(&self, err: &io::Error) {
        let _ = self.write_error.set(err.to_string());
    }

    /// Fixes the status at the hijack sentinel, later `write_header` calls no longer change it.
    pub(crate) fn mark_hijacked(&self) {
        self.header_sent.store(true, Ordering::Release);
        self.hijacked.store(true, Ordering::Release);
        self.status.store(HIJACKED_STATUS, Ordering::Release);
    }

    fn prefix_fields(&self) -> Vec<String> {
        let [date, time] = date_time_fields();
        vec![
            date,
            time,
            self.remote_addr.clone(),
            self.method.clone(),
            self.uri.clone(),
            self.protocol.clone(),
            self.user_agent.clone(),
            self.range.clone(),
        ]
    }

    pub(crate) fn provisional_fields(&self) -> Vec<String> {
        let mut fields = self.prefix_fields();
        fields.push("->".to_owned());
        fields.push(format_request_id(self.id));
        fields
    }

    pub(crate) fn terminal_fields(&self, provisional_logged: bool) -> Vec<String> {
        let mut fields = self.prefix_fields();
        fields.push(self.status().to_string());
        fields.push(self.written().to_string());
        fields.push(format!("{:.6}", self.started.elapsed().as_secs_f64()));
        fields.push(self.write_error.get().cloned().unwrap_or_default());
        fields.push(if provisional_logged {
            format!("<- {}", format_request_id(self.id))
        } else {
            String::new()
        });
        fields
    }
}

/// Writes the terminal record once, either explicitly or when dropped.
///
/// Holds the request’s unit of shutdown work until the record is written.
#[derive(Debug)]
pub(crate) struct Finisher {
    tracker: Arc<RequestTracker>,
    writer: Arc<W3cFormatWriter>,
    timer: Option<ProvisionalTimer>,
    unit: Option<WorkUnit>,
}

impl Finisher {
    pub(crate) fn new(
        tracker: Arc<RequestTracker>,
        writer: Arc<W3cFormatWriter>,
        timer: ProvisionalTimer,
        unit: WorkUnit,
    ) -> Self {
        Self {
            tracker,
            writer,
            timer: Some(timer),
            unit: Some(unit),
        }
    }

    pub(crate) fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    pub(crate) fn finish(mut self) {
        self.complete();
    }

    fn complete(&mut self) {
        let Some(timer) = self.timer.take() else {
            return;
        };
        let provisional_logged = timer.disarm() == Disarm::AlreadyFired;
        let fields = self.tracker.terminal_fields(provisional_logged);
        fail_on_sink_error(self.writer.write(&fields));
        drop(self.unit.take());
    }
}

impl Drop for Finisher {
    fn drop(&mut self) {
        self.complete();
    }
}

/// How the terminal record of a request gets written, chosen once on hijack
#[derive(Debug)]
enum Completion {
    /// Written when the handler returns
    Normal(Box<Finisher>),
    /// Written when the hijacked connection is closed
    Hijacked(Arc<CloseLatch>),
}

/// Response passed to the wrapped handler, updates the tracker on every call.
pub(crate) struct LoggingResponse<'a> {
    inner: &'a mut dyn ResponseWriter,
    tracker: Arc<RequestTracker>,
    shutdown: ShutdownCounter,
    completion: Option<Completion>,
}

impl<'a> LoggingResponse<'a> {
    pub(crate) fn new(
        inner: &'a mut dyn ResponseWriter,
        finisher: Finisher,
        shutdown: ShutdownCounter,
    ) -> Self {
        Self {
            inner,
            tracker: finisher.tracker.clone(),
            shutdown,
            completion: Some(Completion::Normal(Box::new(finisher))),
        }
    }

    /// Called once the wrapped handler returns. Writes the terminal record unless the connection
    /// has been hijacked.
    pub(crate) fn finish(mut self) {
        if let Some(Completion::Normal(finisher)) = self.completion.take() {
            finisher.finish();
        }
    }
}

#[async_trait]
impl ResponseWriter for LoggingResponse<'_> {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    async fn write_header(&mut self, status: StatusCode) -> Result<(), io::Error> {
        self.tracker.record_status(status);
        let result = self.inner.write_header(status).await;
        if let Err(err) = &result {
            self.tracker.record_error(err);
        }
        result
    }

    async fn write_body(&mut self, data: &[u8]) -> Result<usize, io::Error> {
        self.tracker.mark_header_sent();
        let result = self.inner.write_body(data).await;
        match &result {
            Ok(written) => self.tracker.add_written(*written as u64),
            Err(err) => self.tracker.record_error(err),
        }
        result
    }

    fn hijack(&mut self) -> Result<Hijacked, HijackError> {
        if self.tracker.is_hijacked() {
            return Err(HijackError::AlreadyHijacked);
        }
        let Some(Completion::Normal(finisher)) = self.completion.take() else {
            return Err(HijackError::AlreadyHijacked);
        };

        match self.inner.hijack() {
            Ok(hijacked) => {
                self.tracker.mark_hijacked();
                let latch = Arc::new(CloseLatch::new(*finisher, self.shutdown.register()));
                self.completion = Some(Completion::Hijacked(latch.clone()));
                debug!(
                    "Request {} hijacked its connection",
                    format_request_id(self.tracker.id())
                );
                Ok(Hijacked {
                    connection: Box::new(HijackedConnection::new(hijacked.connection, latch)),
                    read_buffer: hijacked.read_buffer,
                })
            }
            Err(err) => {
                if matches!(err, HijackError::NotSupported) {
                    warn!(
                        "Request {} attempted hijacking, not supported by the response",
                        format_request_id(self.tracker.id())
                    );
                }
                self.completion = Some(Completion::Normal(finisher));
                Err(err)
            }
        }
    }
}
