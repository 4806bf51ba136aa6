//! Received-output bookkeeping and the progress sink.
//!
//! A [`Transcript`] keeps every chunk read from the DUT during one test run,
//! in arrival order. A [`Recorder`] pairs it with the caller's text sink so
//! that received lines and status messages reach the GUI/script log as they
//! happen.

use std::fmt;

use log::trace;

/// Callback receiving one progress line at a time.
pub type Sink = Box<dyn FnMut(&str) + Send>;

/// Decode bytes from the DUT, replacing invalid sequences.
pub fn decode_lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Drop control characters and normalise line endings for display.
///
/// Keeps `\n`, `\t` and printable characters; `\r\n` and lone `\r` become `\n`.
pub fn clean_console_text(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    normalized
        .chars()
        .filter(|ch| matches!(ch, '\n' | '\t') || !ch.is_control())
        .collect()
}

/// Append-only record of received chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    chunks: Vec<Vec<u8>>,
}

impl Transcript {
    /// Create an empty transcript.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one received chunk. Empty chunks are ignored.
    pub fn push(&mut self, chunk: &[u8]) {
        if !chunk.is_empty() {
            self.chunks.push(chunk.to_vec());
        }
    }

    /// Received chunks in arrival order.
    pub fn chunks(&self) -> &[Vec<u8>] {
        &self.chunks
    }

    /// Total number of received bytes.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    /// Whether nothing was received.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// All received bytes, concatenated.
    pub fn bytes(&self) -> Vec<u8> {
        self.chunks.concat()
    }

    /// All received output decoded leniently.
    pub fn text(&self) -> String {
        decode_lossy(&self.bytes())
    }
}

impl fmt::Display for Transcript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&clean_console_text(&self.text()))
    }
}

/// Transcript plus line-oriented forwarding to the caller's sink.
pub struct Recorder {
    transcript: Transcript,
    sink: Option<Sink>,
    pending: Vec<u8>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new(None)
    }
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("transcript_bytes", &self.transcript.len())
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

impl Recorder {
    /// Create a recorder forwarding to `sink`, if any.
    pub fn new(sink: Option<Sink>) -> Self {
        Self {
            transcript: Transcript::new(),
            sink,
            pending: Vec::new(),
        }
    }

    /// Replace the sink.
    pub fn set_sink(&mut self, sink: Option<Sink>) {
        self.sink = sink;
    }

    /// Record a chunk received from the DUT.
    ///
    /// Complete lines are forwarded to the sink immediately; a trailing
    /// partial line waits for the next chunk or [`Recorder::flush`].
    pub fn record(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        trace!("rx {} bytes: {:?}", chunk.len(), decode_lossy(chunk));
        self.transcript.push(chunk);
        self.pending.extend_from_slice(chunk);

        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.emit_raw(&line);
        }
    }

    /// Forward any buffered partial line.
    pub fn flush(&mut self) {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.emit_raw(&rest);
        }
    }

    /// Send a status line to the sink.
    pub fn note(&mut self, message: &str) {
        if let Some(sink) = self.sink.as_mut() {
            for line in message.lines() {
                sink(line);
            }
        }
    }

    /// Received output so far.
    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Take the transcript, leaving an empty one for the next run.
    pub fn take_transcript(&mut self) -> Transcript {
        self.flush();
        std::mem::take(&mut self.transcript)
    }

    fn emit_raw(&mut self, bytes: &[u8]) {
        let text = clean_console_text(&decode_lossy(bytes));
        let line = text.trim_end_matches('\n');
        if line.trim().is_empty() {
            return;
        }
        if let Some(sink) = self.sink.as_mut() {
            sink(line);
        }
    }
}
