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

//! Keeps logging connections after the handler took them over from the HTTP layer

use std::fmt::Debug;
use std::io::{self, IoSlice};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::service::Connection;
use crate::shutdown::WorkUnit;
use crate::tracker::Finisher;

#[derive(Debug)]
struct PendingClose {
    finisher: Finisher,
    _connection: WorkUnit,
}

/// Writes the terminal record of a hijacked request exactly once, no matter how often or from
/// how many tasks the connection is closed.
#[derive(Debug)]
pub(crate) struct CloseLatch {
    pending: Mutex<Option<PendingClose>>,
    written: AtomicU64,
}

impl CloseLatch {
    pub(crate) fn new(finisher: Finisher, connection: WorkUnit) -> Self {
        Self {
            pending: Mutex::new(Some(PendingClose {
                finisher,
                _connection: connection,
            })),
            written: AtomicU64::new(0),
        }
    }

    fn add_written(&self, bytes: u64) {
        self.written.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Returns `true` for the call that actually wrote the record. Other callers wait until the
    /// record has been written.
    pub(crate) fn close(&self) -> bool {
        let mut guard = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(pending) = guard.take() else {
            return false;
        };

        let finisher = pending.finisher;
        finisher
            .tracker()
            .add_written(self.written.load(Ordering::Acquire));
        finisher.finish();
        true
    }
}

/// Wraps the transport handed out on hijack, counting the bytes written to it.
///
/// Shutting down or dropping the connection closes the latch.
pub(crate) struct HijackedConnection {
    inner: Box<dyn Connection>,
    latch: Arc<CloseLatch>,
}

impl Debug for HijackedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HijackedConnection")
            .field("latch", &self.latch)
            .finish_non_exhaustive()
    }
}

impl HijackedConnection {
    pub(crate) fn new(inner: Box<dyn Connection>, latch: Arc<CloseLatch>) -> Self {
        Self { inner, latch }
    }
}

impl AsyncRead for HijackedConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for HijackedConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = &result {
            self.latch.add_written(*written as u64);
        }
        result
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write_vectored(cx, bufs);
        if let Poll::Ready(Ok(written)) = &result {
            self.latch.add_written(*written as u64);
        }
        result
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let result = ready!(Pin::new(&mut self.inner).poll_shutdown(cx));
        self.latch.close();
        Poll::Ready(result)
    }
}

impl Drop for HijackedConnection {
    fn drop(&mut self) {
        self.latch.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;
    use test_log::test;
    use tokio::io::{duplex, split, AsyncReadExt, AsyncWriteExt};

    use crate::service::RequestHead;
    use crate::shutdown::ShutdownCounter;
    use crate::timer::ProvisionalTimer;
    use crate::tracker::RequestTracker;
    use crate::writer::tests::SharedSink;
    use crate::writer::{parse_record, W3cFormatWriter};

    fn make_latch(counter: &ShutdownCounter, sink: &SharedSink) -> Arc<CloseLatch> {
        let tracker = Arc::new(RequestTracker::new(7, &RequestHead::default()));
        tracker.add_written(100);
        tracker.mark_hijacked();

        let writer = Arc::new(W3cFormatWriter::new(sink.clone()));
        let timer = ProvisionalTimer::arm(Duration::from_secs(60), counter.register(), || {});
        let finisher = Finisher::new(tracker, writer, timer, counter.register());
        Arc::new(CloseLatch::new(finisher, counter.register()))
    }

    fn status_and_bytes(line: &str) -> (String, String) {
        let fields = parse_record(line).unwrap();
        assert_eq!(fields.len(), 13);
        (fields[8].clone(), fields[9].clone())
    }

    #[test(tokio::test)]
    async fn close_once() {
        let counter = ShutdownCounter::new();
        let sink = SharedSink::default();
        let latch = make_latch(&counter, &sink);
        assert_eq!(counter.outstanding(), 3);

        assert!(latch.close());
        assert!(!latch.close());
        assert_eq!(counter.outstanding(), 0);

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(
            status_and_bytes(&lines[0]),
            ("-1".to_owned(), "100".to_owned())
        );
    }

    #[test(tokio::test)]
    async fn drop_closes() {
        let counter = ShutdownCounter::new();
        let sink = SharedSink::default();
        let latch = make_latch(&counter, &sink);

        let (client, server) = duplex(64);
        let mut connection = HijackedConnection::new(Box::new(server), latch.clone());
        connection.write_all(b"hello").await.unwrap();
        assert!(sink.lines().is_empty());

        drop(connection);
        drop(client);
        assert!(!latch.close());
        assert_eq!(counter.outstanding(), 0);
        assert_eq!(
            status_and_bytes(&sink.lines()[0]),
            ("-1".to_owned(), "105".to_owned())
        );
    }

    #[test(tokio::test)]
    async fn vectored_writes_counted() {
        let counter = ShutdownCounter::new();
        let sink = SharedSink::default();
        let latch = make_latch(&counter, &sink);

        let transport = tokio_test::io::Builder::new()
            .read(b"ping")
            .write(b"pong")
            .write(b"!")
            .build();
        let mut connection = HijackedConnection::new(Box::new(transport), latch);

        let mut request = [0; 4];
        connection.read_exact(&mut request).await.unwrap();
        assert_eq!(&request, b"ping");

        connection.write_all(b"pong").await.unwrap();
        let written = connection
            .write_vectored(&[IoSlice::new(b"!")])
            .await
            .unwrap();
        assert_eq!(written, 1);
        connection.shutdown().await.unwrap();
        assert_eq!(counter.outstanding(), 0);

        drop(connection);
        assert_eq!(
            status_and_bytes(&sink.lines()[0]),
            ("-1".to_owned(), "105".to_owned())
        );
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn concurrent_close() {
        for _ in 0..20 {
            let counter = ShutdownCounter::new();
            let sink = SharedSink::default();
            let latch = make_latch(&counter, &sink);

            let (mut client, server) = duplex(1024);
            let connection = HijackedConnection::new(Box::new(server), latch.clone());
            let (reader, mut writer) = split(connection);
            writer.write_all(b"upgraded protocol data").await.unwrap();

            let shutdown_task = tokio::spawn(async move {
                writer.shutdown().await.unwrap();
                writer
            });
            let close_task = tokio::spawn({
                let latch = latch.clone();
                async move { latch.close() }
            });
            let writer = shutdown_task.await.unwrap();
            close_task.await.unwrap();

            let mut received = Vec::new();
            client.read_to_end(&mut received).await.unwrap();
            assert_eq!(received, b"upgraded protocol data");

            drop(reader);
            drop(writer);
            assert_eq!(counter.outstanding(), 0);

            let lines = sink.lines();
            assert_eq!(lines.len(), 1);
            assert_eq!(
                status_and_bytes(&lines[0]),
                ("-1".to_owned(), "122".to_owned())
            );
        }
    }
}
