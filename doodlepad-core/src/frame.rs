//! `data: <json>\n\n` framing over an incrementally delivered body.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{BoxStream, Stream};
use serde_json::Value;

use crate::error::{CoreResult, DoodlepadError};

const DATA_PREFIX: &str = "data: ";
const FRAME_SEPARATOR: &str = "\n\n";

/// Push-based frame decoder. Feed text chunks of any size; complete frames
/// come back as decoded JSON values in arrival order.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: String,
    dropped: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and decode every frame it completes. The trailing
    /// partial segment stays buffered.
    pub fn push(&mut self, chunk: &str) -> Vec<Value> {
        self.buf.push_str(chunk);
        let mut out = Vec::new();
        while let Some(idx) = self.buf.find(FRAME_SEPARATOR) {
            let segment: String = self.buf.drain(..idx + FRAME_SEPARATOR.len()).collect();
            self.decode_segment(&segment[..idx], &mut out);
        }
        out
    }

    /// End of stream. A segment that never saw its separator is not an
    /// event; it is discarded. Returns the number of discarded bytes.
    pub fn finish(&mut self) -> usize {
        let tail = std::mem::take(&mut self.buf);
        if !tail.trim().is_empty() {
            tracing::debug!(bytes = tail.len(), "discarding incomplete trailing frame");
        }
        tail.len()
    }

    /// Lines that carried the data prefix but failed to decode.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn decode_segment(&mut self, segment: &str, out: &mut Vec<Value>) {
        for line in segment.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
                continue;
            };
            match serde_json::from_str::<Value>(payload) {
                Ok(v) => out.push(v),
                Err(e) => {
                    self.dropped += 1;
                    tracing::warn!(line = %preview(line, 100), error = %e, "dropping undecodable frame");
                }
            }
        }
    }
}

fn preview(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Byte source for a frame stream (a response body, or a canned body in tests).
pub type ByteStream = BoxStream<'static, CoreResult<Bytes>>;

/// Stream adapter: bytes in, decoded JSON frames out.
///
/// UTF-8 is decoded incrementally, so a multi-byte character split across
/// chunks survives. A transport error is yielded once and ends the stream.
pub struct FrameStream<S = ByteStream> {
    inner: S,
    decoder: FrameDecoder,
    pending: VecDeque<Value>,
    carry: Vec<u8>,
    done: bool,
}

impl<S> FrameStream<S>
where
    S: Stream<Item = CoreResult<Bytes>> + Unpin,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
            carry: Vec::new(),
            done: false,
        }
    }

    pub fn frames_dropped(&self) -> u64 {
        self.decoder.dropped()
    }

    fn take_text(&mut self) -> String {
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.carry) {
                Ok(s) => {
                    text.push_str(s);
                    self.carry.clear();
                    return text;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // Safe: `valid_up_to` marks the end of a valid prefix.
                    text.push_str(std::str::from_utf8(&self.carry[..valid]).unwrap_or_default());
                    match e.error_len() {
                        // Incomplete sequence at the end; wait for more bytes.
                        None => {
                            self.carry.drain(..valid);
                            return text;
                        }
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.carry.drain(..valid + bad);
                        }
                    }
                }
            }
        }
    }
}

impl<S> Stream for FrameStream<S>
where
    S: Stream<Item = CoreResult<Bytes>> + Unpin,
{
    type Item = CoreResult<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(v) = self.pending.pop_front() {
                return Poll::Ready(Some(Ok(v)));
            }
            if self.done {
                return Poll::Ready(None);
            }
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    self.carry.extend_from_slice(&chunk);
                    let text = self.take_text();
                    let frames = self.decoder.push(&text);
                    self.pending.extend(frames);
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    if !self.carry.is_empty() {
                        let tail = String::from_utf8_lossy(&self.carry).into_owned();
                        self.carry.clear();
                        let frames = self.decoder.push(&tail);
                        self.pending.extend(frames);
                    }
                    self.decoder.finish();
                    self.done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Byte-level stall detection. The timer restarts on every chunk, so a
/// frame that takes longer than `limit` to arrive is fine as long as bytes
/// keep flowing. When it fires, `DoodlepadError::Stalled` is yielded once
/// and the stream ends. With no limit the inner stream passes through.
pub struct StallGuard<S> {
    inner: S,
    limit: Option<Duration>,
    timer: Option<Pin<Box<tokio::time::Sleep>>>,
    fired: bool,
}

impl<S> StallGuard<S>
where
    S: Stream<Item = CoreResult<Bytes>> + Unpin,
{
    /// Must be called inside a tokio runtime when `limit` is set.
    pub fn new(inner: S, limit: Option<Duration>) -> Self {
        Self {
            inner,
            limit,
            timer: limit.map(|d| Box::pin(tokio::time::sleep(d))),
            fired: false,
        }
    }
}

impl<S> Stream for StallGuard<S>
where
    S: Stream<Item = CoreResult<Bytes>> + Unpin,
{
    type Item = CoreResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.fired {
            return Poll::Ready(None);
        }
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(item) => {
                if let (Some(timer), Some(limit)) = (this.timer.as_mut(), this.limit) {
                    timer.as_mut().reset(tokio::time::Instant::now() + limit);
                }
                Poll::Ready(item)
            }
            Poll::Pending => {
                let Some(timer) = this.timer.as_mut() else {
                    return Poll::Pending;
                };
                match timer.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        this.fired = true;
                        let limit_ms = this.limit.map(|d| d.as_millis() as u64).unwrap_or_default();
                        Poll::Ready(Some(Err(DoodlepadError::Stalled { limit_ms })))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}
