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

//! Serializes log records in the W3C Extended Log Format

use log::error;
use std::fmt::Debug;
use std::io::{self, Write};
use std::sync::Mutex;

use crate::error::SinkError;

const DELIMITER: u8 = b' ';
const QUOTE: u8 = b'"';
const COMMENT_MARKER: u8 = b'#';

fn needs_quotes(field: &str) -> bool {
    if field.is_empty() {
        return false;
    }
    // A lone `\.` would be mistaken for an end-of-data marker by some readers
    field == r"\."
        || field.starts_with(char::is_whitespace)
        || field
            .bytes()
            .any(|byte| matches!(byte, DELIMITER | QUOTE | b'\r' | b'\n'))
}

fn write_escaped(buf: &mut Vec<u8>, field: &str) {
    if !needs_quotes(field) {
        buf.extend_from_slice(field.as_bytes());
        return;
    }

    buf.push(QUOTE);
    for byte in field.bytes() {
        if byte == QUOTE {
            buf.push(QUOTE);
        }
        buf.push(byte);
    }
    buf.push(QUOTE);
}

fn write_fields<S: AsRef<str>>(buf: &mut Vec<u8>, fields: &[S]) {
    for (index, field) in fields.iter().enumerate() {
        if index > 0 {
            buf.push(DELIMITER);
        }
        write_escaped(buf, field.as_ref());
    }
    buf.push(b'\n');
}

/// Splits a record line produced by [`W3cFormatWriter::write`] back into its fields.
///
/// The line should not contain the trailing newline, comment lines need to have their `#` marker
/// removed first. Returns `None` if the quoting is malformed.
pub fn parse_record(line: &str) -> Option<Vec<String>> {
    let mut fields = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        let mut field = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next()? {
                    '"' => {
                        if chars.peek() == Some(&'"') {
                            chars.next();
                            field.push('"');
                        } else {
                            break;
                        }
                    }
                    c => field.push(c),
                }
            }
            match chars.next() {
                None => {
                    fields.push(field);
                    return Some(fields);
                }
                Some(' ') => fields.push(field),
                Some(_) => return None,
            }
        } else {
            loop {
                match chars.next() {
                    None => {
                        fields.push(field);
                        return Some(fields);
                    }
                    Some(' ') => break,
                    Some('"') => return None,
                    Some(c) => field.push(c),
                }
            }
            fields.push(field);
        }
    }
}

struct WriterState {
    sink: Box<dyn Write + Send>,
    buf: Vec<u8>,
}

impl WriterState {
    fn send_buffer(&mut self) -> Result<(), SinkError> {
        let result = self
            .sink
            .write_all(&self.buf)
            .and_then(|_| self.sink.flush());
        self.buf.clear();
        result.map_err(SinkError)
    }
}

/// Writes records to a line sink, one complete line at a time.
///
/// All methods serialize on an internal lock so that records of concurrent requests never
/// interleave. The sink is flushed after every record, making the log usable for tailing
/// consumers like syslog.
pub struct W3cFormatWriter {
    state: Mutex<WriterState>,
}

impl Debug for W3cFormatWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("W3cFormatWriter").finish_non_exhaustive()
    }
}

impl W3cFormatWriter {
    /// Creates a writer sending its records to `sink`.
    pub fn new(sink: impl Write + Send + 'static) -> Self {
        Self {
            state: Mutex::new(WriterState {
                sink: Box::new(sink),
                buf: Vec::with_capacity(512),
            }),
        }
    }

    fn with_state(&self, fill: impl FnOnce(&mut Vec<u8>)) -> Result<(), SinkError> {
        let mut state = self.state.lock().map_err(|_| {
            SinkError(io::Error::new(
                io::ErrorKind::Other,
                "log writer unusable after an earlier failure",
            ))
        })?;
        fill(&mut state.buf);
        state.send_buffer()
    }

    /// Writes a plain record.
    pub fn write<S: AsRef<str>>(&self, fields: &[S]) -> Result<(), SinkError> {
        self.with_state(|buf| write_fields(buf, fields))
    }

    /// Writes a record prefixed with the comment marker.
    pub fn write_commented<S: AsRef<str>>(&self, fields: &[S]) -> Result<(), SinkError> {
        self.with_state(|buf| {
            buf.push(COMMENT_MARKER);
            write_fields(buf, fields);
        })
    }

    /// Writes a free-text comment line, the text is not escaped.
    pub fn write_comment(&self, comment: &str) -> Result<(), SinkError> {
        self.with_state(|buf| {
            buf.push(COMMENT_MARKER);
            buf.extend_from_slice(comment.as_bytes());
            buf.push(b'\n');
        })
    }
}

/// Sink failures are fatal, this logs the error and panics.
pub(crate) fn fail_on_sink_error(result: Result<(), SinkError>) {
    if let Err(err) = result {
        error!("Access log is no longer writable: {err}");
        panic!("{err}");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::sync::Arc;
    use test_log::test;

    /// In-memory sink that can be inspected while the writer still owns a clone
    #[derive(Debug, Clone, Default)]
    pub(crate) struct SharedSink {
        data: Arc<Mutex<Vec<u8>>>,
        pub(crate) flushes: Arc<Mutex<usize>>,
    }

    impl SharedSink {
        pub(crate) fn contents(&self) -> String {
            String::from_utf8(self.data.lock().unwrap().clone()).unwrap()
        }

        pub(crate) fn lines(&self) -> Vec<String> {
            self.contents().lines().map(ToOwned::to_owned).collect()
        }
    }

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.data.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            *self.flushes.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[derive(Debug)]
    struct BrokenSink;

    impl Write for BrokenSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn escaping() {
        let mut buf = Vec::new();
        write_fields(&mut buf, &["abcd", "", "a b", "say \"hi\"", "two\nlines", r"\.", "-"]);
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "abcd  \"a b\" \"say \"\"hi\"\"\" \"two\nlines\" \"\\.\" -\n"
        );

        let mut buf = Vec::new();
        write_fields(&mut buf, &["\tindented", "\u{a0}nbsp", "trailing\t", "in\tside"]);
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "\"\tindented\" \"\u{a0}nbsp\" trailing\t in\tside\n"
        );
    }

    #[test]
    fn parsing() {
        assert_eq!(
            parse_record("abcd  \"a b\" \"say \"\"hi\"\"\" -"),
            Some(vec![
                "abcd".to_owned(),
                String::new(),
                "a b".to_owned(),
                "say \"hi\"".to_owned(),
                "-".to_owned(),
            ])
        );
        assert_eq!(parse_record(""), Some(vec![String::new()]));
        assert_eq!(parse_record("a "), Some(vec!["a".to_owned(), String::new()]));
        assert_eq!(parse_record("\"unterminated"), None);
        assert_eq!(parse_record("\"ab\"c"), None);
        assert_eq!(parse_record("a\"b"), None);
    }

    #[test]
    fn escaping_round_trip() {
        let fields = ["Mozilla/5.0 (X11; \"Linux\")", "bytes=0-", "", "/a b/\"c\""];
        let sink = SharedSink::default();
        let writer = W3cFormatWriter::new(sink.clone());
        writer.write(&fields).unwrap();

        let contents = sink.contents();
        let line = contents.strip_suffix('\n').unwrap();
        assert_eq!(parse_record(line).unwrap(), fields);
    }

    #[test]
    fn record_kinds() {
        let sink = SharedSink::default();
        let writer = W3cFormatWriter::new(sink.clone());
        writer.write(&["a", "b c"]).unwrap();
        writer.write_commented(&["->", "0x00000001"]).unwrap();
        writer.write_comment("Version: 1.0").unwrap();

        assert_eq!(
            sink.lines(),
            vec!["a \"b c\"", "#-> 0x00000001", "#Version: 1.0"]
        );
        assert_eq!(*sink.flushes.lock().unwrap(), 3);
    }

    #[test]
    fn concurrent_records_do_not_interleave() {
        let sink = SharedSink::default();
        let writer = Arc::new(W3cFormatWriter::new(sink.clone()));

        let threads: Vec<_> = (0..8)
            .map(|thread| {
                let writer = writer.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let field = format!("thread {thread} record {i}");
                        writer.write(&[field.as_str(), "x"]).unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let lines = sink.lines();
        assert_eq!(lines.len(), 800);
        for line in lines {
            let fields = parse_record(&line).unwrap();
            assert_eq!(fields.len(), 2);
            assert!(fields[0].starts_with("thread "));
            assert_eq!(fields[1], "x");
        }
    }

    #[test]
    fn sink_failure() {
        let writer = W3cFormatWriter::new(BrokenSink);
        let err = writer.write(&["a"]).unwrap_err();
        assert_eq!(err.0.kind(), io::ErrorKind::BrokenPipe);
        assert!(writer.write_comment("still broken").is_err());
    }
}
