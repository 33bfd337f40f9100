//! Stream sessions: one request, one byte stream, one folded document.
//!
//! `SessionFolder` is the synchronous state machine
//! (`Idle -> Streaming -> Completed | Failed | Cancelled`); `StreamSession`
//! drives it from a `FrameStream` on a single task.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::field;
use tracing_futures::Instrument;

use crate::error::{CoreResult, DoodlepadError};
use crate::event::{Failure, GENERIC_FAILURE_REASON, GenerationEvent};
use crate::frame::{FrameStream, StallGuard};
use crate::model::{DocumentKind, EnrichedDocument, ImageMap, PartialDocument};
use crate::observer::SessionObserver;
use crate::telemetry::{self, SessionTrace};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Generate,
    Edit,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Edit => "edit",
        }
    }
}

/// Source of canonical documents, used to enrich an edit snapshot with images.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch_document(&self, kind: DocumentKind, document_id: &str) -> CoreResult<EnrichedDocument>;
}

/// What folding one event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Folded {
    /// Session already closed, or the snapshot was stale.
    Ignored,
    Applied,
    /// A document snapshot was published.
    Snapshot,
    Terminal,
}

/// Everything a session accumulated, handed over once it is terminal.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub id: u64,
    pub state: SessionState,
    pub document: Option<PartialDocument>,
    pub images: ImageMap,
    pub failure: Option<Failure>,
    pub last_status: Option<String>,
    pub events_folded: u64,
    pub images_received: u64,
}

/// Folds events into a document and image map, calling the observer after
/// each increment. Terminal states are final: later events are ignored and
/// no callback fires once the cancel token is set.
pub struct SessionFolder<O> {
    id: u64,
    observer: O,
    cancel: CancellationToken,
    state: SessionState,
    document: Option<PartialDocument>,
    images: ImageMap,
    failure: Option<Failure>,
    last_status: Option<String>,
    events_folded: u64,
    images_received: u64,
}

impl<O: SessionObserver> SessionFolder<O> {
    pub fn new(observer: O, cancel: CancellationToken) -> Self {
        Self {
            id: 0,
            observer,
            cancel,
            state: SessionState::Idle,
            document: None,
            images: ImageMap::new(),
            failure: None,
            last_status: None,
            events_folded: 0,
            images_received: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn document(&self) -> Option<&PartialDocument> {
        self.document.as_ref()
    }

    pub fn images(&self) -> &ImageMap {
        &self.images
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    /// The transport confirmed a response stream.
    pub fn start(&mut self) {
        if self.state == SessionState::Idle {
            self.state = SessionState::Streaming;
        }
    }

    /// Streaming and not cancelled. Observes the cancel token lazily.
    fn live(&mut self) -> bool {
        if self.state == SessionState::Streaming && self.cancel.is_cancelled() {
            self.state = SessionState::Cancelled;
        }
        self.state == SessionState::Streaming
    }

    pub fn fold(&mut self, event: GenerationEvent) -> Folded {
        if !self.live() {
            tracing::debug!(event = event.label(), state = self.state.as_str(), "ignoring event, session not streaming");
            return Folded::Ignored;
        }
        self.events_folded += 1;
        match event {
            GenerationEvent::Init { document_id } => {
                self.observer.on_init(document_id.as_deref());
                Folded::Applied
            }
            GenerationEvent::DocumentReady { document } => {
                if self.publish_snapshot(document) {
                    Folded::Snapshot
                } else {
                    Folded::Ignored
                }
            }
            GenerationEvent::ImageReady { key, image_data } => {
                self.images = self.images.with_image(key, image_data);
                self.images_received += 1;
                self.observer.on_images(self.document.as_ref(), &self.images);
                Folded::Applied
            }
            GenerationEvent::StatusUpdate { message } => {
                self.observer.on_status(&message);
                self.last_status = Some(message);
                Folded::Applied
            }
            GenerationEvent::Complete { message, document } => {
                if let Some(doc) = document
                    && self.document.as_ref() != Some(&doc)
                {
                    self.publish_snapshot(doc);
                }
                self.state = SessionState::Completed;
                self.last_status = Some(message.clone());
                self.observer.on_complete(&message);
                Folded::Terminal
            }
            GenerationEvent::Failure(failure) => {
                self.terminate(failure);
                Folded::Terminal
            }
        }
    }

    /// Replace the document wholesale. The first snapshot starts a fresh
    /// image map; later ones keep the images folded so far.
    fn publish_snapshot(&mut self, document: PartialDocument) -> bool {
        if let Some(current) = &self.document
            && document.version < current.version
        {
            tracing::warn!(
                document_id = %document.id,
                received = document.version,
                current = current.version,
                "ignoring stale document snapshot"
            );
            return false;
        }
        if self.document.is_none() && !self.images.is_empty() {
            tracing::debug!(discarded = self.images.len(), "first snapshot resets images");
            self.images = ImageMap::new();
        }
        let doc = self.document.insert(document);
        self.observer.on_document(doc, &self.images);
        true
    }

    /// Second publish after an edit snapshot: only when the canonical copy
    /// differs from `shown` or brings images the map does not hold yet.
    pub fn apply_enrichment(&mut self, shown: &PartialDocument, enriched: EnrichedDocument) -> bool {
        if !self.live() {
            return false;
        }
        let has_new_images = enriched
            .images
            .iter()
            .any(|(k, v)| self.images.get(k) != Some(v));
        if enriched.document == *shown && !has_new_images {
            tracing::debug!(document_id = %shown.id, "enrichment matches the published snapshot");
            return false;
        }
        if let Some(current) = &self.document
            && enriched.document.version < current.version
        {
            tracing::warn!(document_id = %shown.id, "enrichment returned an older version");
            return false;
        }
        self.images = self.images.merged(&enriched.images);
        let doc = self.document.insert(enriched.document);
        self.observer.on_document(doc, &self.images);
        true
    }

    /// Synthesized failure (transport error, bad status, premature end).
    /// Valid before the stream opens, so callers have one error path.
    pub fn fail(&mut self, failure: Failure) -> Folded {
        if self.state == SessionState::Idle {
            self.state = SessionState::Streaming;
        }
        if !self.live() {
            return Folded::Ignored;
        }
        self.terminate(failure);
        Folded::Terminal
    }

    fn terminate(&mut self, failure: Failure) {
        self.state = SessionState::Failed;
        self.observer.on_error(&failure);
        self.failure = Some(failure);
    }

    pub fn mark_cancelled(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Cancelled;
        }
    }

    pub fn into_report(self) -> SessionReport {
        SessionReport {
            id: self.id,
            state: self.state,
            document: self.document,
            images: self.images,
            failure: self.failure,
            last_status: self.last_status,
            events_folded: self.events_folded,
            images_received: self.images_received,
        }
    }
}

enum NextFrame {
    Frame(Value),
    Failed(DoodlepadError),
    Ended,
}

async fn next_frame<S>(frames: &mut FrameStream<S>) -> NextFrame
where
    S: Stream<Item = CoreResult<Bytes>> + Unpin,
{
    match frames.next().await {
        Some(Ok(v)) => NextFrame::Frame(v),
        Some(Err(e)) => NextFrame::Failed(e),
        None => NextFrame::Ended,
    }
}

/// One generation or edit interaction. Never reused.
pub struct StreamSession<O> {
    id: u64,
    kind: DocumentKind,
    mode: SessionMode,
    folder: SessionFolder<O>,
    cancel: CancellationToken,
    finished: Arc<AtomicBool>,
    stall_timeout: Option<Duration>,
    source: Option<Arc<dyn DocumentSource>>,
}

impl<O: SessionObserver> StreamSession<O> {
    pub fn new(kind: DocumentKind, mode: SessionMode, observer: O) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let mut folder = SessionFolder::new(observer, cancel.clone());
        folder.id = id;
        Self {
            id,
            kind,
            mode,
            folder,
            cancel,
            finished: Arc::new(AtomicBool::new(false)),
            stall_timeout: None,
            source: None,
        }
    }

    /// Fail the session when no bytes arrive for `limit`.
    pub fn with_stall_timeout(mut self, limit: Option<Duration>) -> Self {
        self.stall_timeout = limit;
        self
    }

    /// Re-fetch the canonical document after each edit snapshot.
    pub fn with_enrichment(mut self, source: Arc<dyn DocumentSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn canceller(&self) -> SessionCanceller {
        SessionCanceller {
            id: self.id,
            token: self.cancel.clone(),
            finished: self.finished.clone(),
        }
    }

    /// Open the stream with `open` and fold it to a terminal state.
    /// The byte stream is dropped before this returns.
    pub async fn run<F, S>(self, open: F) -> SessionReport
    where
        F: Future<Output = CoreResult<S>>,
        S: Stream<Item = CoreResult<Bytes>> + Unpin,
    {
        let span = tracing::info_span!(
            "stream_session",
            session.id = self.id,
            content.kind = self.kind.as_str(),
            session.mode = self.mode.as_str(),
            session.outcome = field::Empty,
            events.folded = field::Empty,
            images.count = field::Empty,
            frames.dropped = field::Empty,
            latency.ms = field::Empty,
            failure.kind = field::Empty,
            failure.code = field::Empty,
        );
        let (id, kind, mode) = (self.id, self.kind, self.mode);
        let finished = self.finished.clone();
        let started = Instant::now();
        let (report, dropped) = self.drive(open).instrument(span.clone()).await;
        finished.store(true, Ordering::Release);

        let latency_ms = started.elapsed().as_millis() as u64;
        let failure_kind = report.failure.as_ref().map(|f| {
            if f.is_entitlement() {
                "entitlement_required"
            } else {
                "generic"
            }
        });
        let failure_code = report.failure.as_ref().and_then(|f| f.code.as_deref());

        span.record(telemetry::KEY_OUTCOME, report.state.as_str());
        span.record(telemetry::KEY_EVENTS_FOLDED, report.events_folded);
        span.record(telemetry::KEY_IMAGES_COUNT, report.images.len() as u64);
        span.record(telemetry::KEY_FRAMES_DROPPED, dropped);
        span.record(telemetry::KEY_LATENCY_MS, latency_ms);
        if let Some(k) = failure_kind {
            span.record(telemetry::KEY_FAILURE_KIND, k);
        }
        if let Some(c) = failure_code {
            span.record(telemetry::KEY_FAILURE_CODE, c);
        }

        telemetry::emit(
            SessionTrace::new(id)
                .kind(kind.as_str())
                .mode(mode.as_str())
                .outcome(report.state.as_str())
                .counts(report.events_folded, dropped, report.images_received)
                .latency_ms(latency_ms)
                .failure_opt(failure_kind, failure_code),
        );
        report
    }

    /// Run on a new tokio task.
    pub fn spawn<F, S>(self, open: F) -> SessionHandle
    where
        O: Send + 'static,
        F: Future<Output = CoreResult<S>> + Send + 'static,
        S: Stream<Item = CoreResult<Bytes>> + Unpin + Send + 'static,
    {
        let canceller = self.canceller();
        let task = tokio::spawn(self.run(open));
        SessionHandle { canceller, task }
    }

    async fn drive<F, S>(mut self, open: F) -> (SessionReport, u64)
    where
        F: Future<Output = CoreResult<S>>,
        S: Stream<Item = CoreResult<Bytes>> + Unpin,
    {
        let cancel = self.cancel.clone();
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = open => Some(r),
        };
        let body = match opened {
            None => {
                tracing::debug!("cancelled before the stream opened");
                self.folder.mark_cancelled();
                return (self.folder.into_report(), 0);
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, error_kind = e.kind(), "stream request failed");
                self.folder.fail(Failure::from(&e));
                return (self.folder.into_report(), 0);
            }
            Some(Ok(body)) => body,
        };

        self.folder.start();
        tracing::info!("stream opened");
        let mut frames = FrameStream::new(StallGuard::new(body, self.stall_timeout));
        let mut malformed = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("session cancelled");
                    self.folder.mark_cancelled();
                    break;
                }
                next = next_frame(&mut frames) => next,
            };
            match next {
                NextFrame::Frame(value) => match GenerationEvent::from_value(value) {
                    Ok(Some(event)) => {
                        tracing::debug!(event = event.label(), "folding event");
                        if self.folder.fold(event) == Folded::Snapshot {
                            self.enrich(&cancel).await;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        malformed += 1;
                        tracing::warn!(error = %e, "dropping malformed event");
                    }
                },
                NextFrame::Failed(DoodlepadError::Stalled { limit_ms }) => {
                    tracing::warn!(limit_ms, "stream stalled");
                    self.folder.fail(Failure::generic("stream stalled"));
                }
                NextFrame::Failed(e) => {
                    tracing::warn!(error = %e, "stream transport failed");
                    self.folder.fail(Failure::from(&e));
                }
                NextFrame::Ended => {
                    tracing::warn!("stream ended before a terminal event");
                    self.folder.fail(Failure::generic(GENERIC_FAILURE_REASON));
                }
            }
            if self.folder.state().is_terminal() {
                break;
            }
        }

        let dropped = frames.frames_dropped() + malformed;
        // Releases the connection.
        drop(frames);
        (self.folder.into_report(), dropped)
    }

    async fn enrich(&mut self, cancel: &CancellationToken) {
        if self.mode != SessionMode::Edit {
            return;
        }
        let (Some(source), Some(shown)) = (self.source.clone(), self.folder.document().cloned()) else {
            return;
        };
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            r = source.fetch_document(shown.kind, &shown.id) => r,
        };
        match fetched {
            Ok(enriched) => {
                if self.folder.apply_enrichment(&shown, enriched) {
                    tracing::debug!(document_id = %shown.id, "published enriched snapshot");
                }
            }
            Err(e) => tracing::warn!(document_id = %shown.id, error = %e, "enrichment fetch failed"),
        }
    }
}

/// Cheap, cloneable cancel switch for one session.
#[derive(Debug, Clone)]
pub struct SessionCanceller {
    id: u64,
    token: CancellationToken,
    finished: Arc<AtomicBool>,
}

impl SessionCanceller {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop reading and release the transport. No callback fires afterwards;
    /// a no-op once the session is terminal.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The session reached a terminal state and holds no transport.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn is_active(&self) -> bool {
        !self.is_finished() && !self.is_cancelled()
    }
}

/// A spawned session.
pub struct SessionHandle {
    canceller: SessionCanceller,
    task: JoinHandle<SessionReport>,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.canceller.id
    }

    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    pub fn canceller(&self) -> SessionCanceller {
        self.canceller.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the terminal report.
    pub async fn join(self) -> CoreResult<SessionReport> {
        self.task
            .await
            .map_err(|e| DoodlepadError::Other(anyhow::anyhow!("session task failed: {e}")))
    }
}

/// At most one active session per UI surface: installing a new session
/// cancels the one before it.
#[derive(Debug, Default)]
pub struct SessionSlot {
    active: Mutex<Option<SessionCanceller>>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, next: SessionCanceller) {
        let prev = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(next);
        if let Some(prev) = prev
            && prev.is_active()
        {
            tracing::debug!(session_id = prev.id(), "cancelling previous session");
            prev.cancel();
        }
    }

    /// Cancel the installed session. Returns whether it was still running.
    pub fn cancel_active(&self) -> bool {
        match self.active.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(c) if c.is_active() => {
                tracing::debug!(session_id = c.id(), "cancelling active session");
                c.cancel();
                true
            }
            _ => false,
        }
    }
}
