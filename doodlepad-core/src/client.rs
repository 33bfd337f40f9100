use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Serialize;
use serde_json::Value;

use crate::config::Config;
use crate::error::{CoreResult, DoodlepadError};
use crate::http_client::{HttpClient, RequestCtx};
use crate::model::{DocumentKind, EditBody, EnrichedDocument, GenerateBody};
use crate::normalizer::validate_prompt;
use crate::observer::SessionObserver;
use crate::session::{DocumentSource, SessionHandle, SessionMode, SessionSlot, StreamSession};

/// Who is asking. Both parts are optional for generation.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    /// Sent as a bearer token.
    pub token: Option<SecretString>,
    /// Sent as `user_id` in the generation body.
    pub user_id: Option<String>,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_token(token: SecretString) -> Self {
        Self {
            token: Some(token),
            user_id: None,
        }
    }
}

/// Starts generation and edit sessions against the content backend.
///
/// Starting a session cancels the one it replaces, so at most one session
/// per client folds into the caller's state. Session methods spawn onto the
/// current tokio runtime.
#[derive(Clone)]
pub struct GenerationClient {
    http: HttpClient,
    base_url: String,
    stall_timeout: Option<Duration>,
    slot: Arc<SessionSlot>,
}

impl GenerationClient {
    pub fn new(cfg: &Config) -> CoreResult<Self> {
        let http = HttpClient::new(&cfg.http)?;
        Ok(Self::with_base(http, &cfg.api.base_url).with_stall_timeout(cfg.stream.stall_timeout()))
    }

    pub fn with_base(http: HttpClient, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            stall_timeout: None,
            slot: Arc::new(SessionSlot::new()),
        }
    }

    pub fn with_stall_timeout(mut self, limit: Option<Duration>) -> Self {
        self.stall_timeout = limit;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Generate a new document about `prompt`.
    ///
    /// A blank prompt is rejected here and no session is created. Any other
    /// failure, including a refused request, arrives through
    /// `observer.on_error`.
    pub fn start_generation<O: SessionObserver>(
        &self,
        prompt: &str,
        kind: DocumentKind,
        identity: &Identity,
        observer: O,
    ) -> CoreResult<SessionHandle> {
        let topic = validate_prompt(prompt, "topic")?;
        let body = GenerateBody {
            topic,
            user_id: identity.user_id.clone(),
        };
        let session = StreamSession::new(kind, SessionMode::Generate, observer).with_stall_timeout(self.stall_timeout);
        tracing::info!(kind = %kind, session_id = session.id(), "starting generation");
        Ok(self.launch(session, self.url(&kind.generate_path()), body, identity.token.clone()))
    }

    /// Apply a free-text edit to an existing document. Each snapshot the
    /// edit stream delivers is followed by a re-fetch of the canonical copy
    /// with its images. Both requests carry `identity`'s token.
    pub fn start_edit<O: SessionObserver>(
        &self,
        kind: DocumentKind,
        document_id: &str,
        request: &str,
        identity: &Identity,
        observer: O,
    ) -> CoreResult<SessionHandle> {
        let document_id = document_id.trim();
        if document_id.is_empty() {
            return Err(DoodlepadError::Validation("document id must not be empty".into()));
        }
        let request = validate_prompt(request, "edit request")?;
        let session = StreamSession::new(kind, SessionMode::Edit, observer)
            .with_stall_timeout(self.stall_timeout)
            .with_enrichment(Arc::new(AuthedSource {
                client: self.clone(),
                identity: identity.clone(),
            }));
        tracing::info!(kind = %kind, document_id, session_id = session.id(), "starting edit");
        Ok(self.launch(session, self.url(&kind.edit_path(document_id)), EditBody { request }, identity.token.clone()))
    }

    fn launch<O, B>(&self, session: StreamSession<O>, url: String, body: B, token: Option<SecretString>) -> SessionHandle
    where
        O: SessionObserver,
        B: Serialize + Send + Sync + 'static,
    {
        let http = self.http.clone();
        let open = async move {
            let ctx = RequestCtx {
                bearer: token.as_ref(),
                request_id: None,
            };
            http.post_stream(&url, &body, &ctx).await
        };
        self.slot.replace(session.canceller());
        session.spawn(open)
    }

    /// Cancel whichever session this client started last.
    pub fn cancel_active(&self) -> bool {
        self.slot.cancel_active()
    }

    /// Read a saved document together with its images.
    pub async fn fetch_document(
        &self,
        kind: DocumentKind,
        document_id: &str,
        identity: &Identity,
    ) -> CoreResult<EnrichedDocument> {
        let url = self.url(&kind.fetch_path(document_id));
        let ctx = RequestCtx {
            bearer: identity.token.as_ref(),
            request_id: None,
        };
        let envelope: Value = self.http.get_json(&url, &ctx).await?;
        EnrichedDocument::from_envelope(kind, envelope)
    }
}

/// Enrichment fetches made on behalf of one edit session's caller.
struct AuthedSource {
    client: GenerationClient,
    identity: Identity,
}

#[async_trait]
impl DocumentSource for AuthedSource {
    async fn fetch_document(&self, kind: DocumentKind, document_id: &str) -> CoreResult<EnrichedDocument> {
        self.client.fetch_document(kind, document_id, &self.identity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::FailureKind;
    use crate::observer::{ChannelObserver, SessionUpdate};
    use crate::session::SessionState;
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    const LESSON_STREAM: &str = concat!(
        "data: {\"type\":\"init\"}\n\n",
        "data: {\"type\":\"status\",\"message\":\"Generating lesson structure...\"}\n\n",
        "data: {\"type\":\"lesson\",\"lesson\":{\"id\":\"L1\",\"title\":\"Photosynthesis\",\"version\":1}}\n\n",
        "data: {\"type\":\"image\",\"key\":\"introduction\",\"image\":\"data:image/png;base64,AAAA\"}\n\n",
        "data: {\"type\":\"complete\",\"message\":\"Lesson generated successfully!\"}\n\n",
    );

    fn client(server: &MockServer) -> GenerationClient {
        GenerationClient::with_base(HttpClient::new_default().unwrap(), server.url("/api/"))
    }

    fn drain(rx: &mut UnboundedReceiver<SessionUpdate>) -> Vec<SessionUpdate> {
        let mut out = Vec::new();
        while let Ok(u) = rx.try_recv() {
            out.push(u);
        }
        out
    }

    #[tokio::test]
    async fn generation_streams_to_completion() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/api/generate-lesson-stream")
                .header("authorization", "Bearer tok-1")
                .json_body(json!({"topic": "Photosynthesis", "user_id": "u1"}));
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(LESSON_STREAM);
        });

        let identity = Identity {
            token: Some(SecretString::from("tok-1".to_string())),
            user_id: Some("u1".into()),
        };
        let (obs, mut rx) = ChannelObserver::new();
        let handle = client(&server)
            .start_generation("  Photosynthesis\r\n", DocumentKind::Lesson, &identity, obs)
            .unwrap();
        let report = handle.join().await.unwrap();

        m.assert();
        assert_eq!(report.state, SessionState::Completed);
        assert_eq!(report.document.unwrap().title, "Photosynthesis");
        assert_eq!(report.images.get("introduction"), Some("data:image/png;base64,AAAA"));

        let updates = drain(&mut rx);
        assert_eq!(updates.len(), 5);
        assert_eq!(updates[1], SessionUpdate::Status("Generating lesson structure...".into()));
        assert_eq!(updates[4], SessionUpdate::Complete("Lesson generated successfully!".into()));
    }

    #[tokio::test]
    async fn blank_prompt_creates_no_session() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST).path("/api/generate-lesson-stream");
            then.status(200).body(LESSON_STREAM);
        });
        let (obs, mut rx) = ChannelObserver::new();
        let err = client(&server)
            .start_generation(" \n\t ", DocumentKind::Lesson, &Identity::anonymous(), obs)
            .err()
            .expect("blank prompt rejected");
        assert!(matches!(err, DoodlepadError::Validation(_)));
        assert_eq!(m.hits(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn refused_request_reports_one_generic_error() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/api/generate-presentation-stream");
            then.status(400).json_body(json!({"error": "Topic is required"}));
        });
        let (obs, mut rx) = ChannelObserver::new();
        let report = client(&server)
            .start_generation("Volcanoes", DocumentKind::Presentation, &Identity::anonymous(), obs)
            .unwrap()
            .join()
            .await
            .unwrap();
        assert_eq!(report.state, SessionState::Failed);
        match &drain(&mut rx)[..] {
            [SessionUpdate::Error(f)] => assert_eq!(f.kind, FailureKind::Generic),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn refused_for_subscription_reports_entitlement() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/api/generate-worksheet-stream");
            then.status(403).json_body(json!({"error": "trial_expired"}));
        });
        let (obs, mut rx) = ChannelObserver::new();
        client(&server)
            .start_generation("Fractions", DocumentKind::Worksheet, &Identity::anonymous(), obs)
            .unwrap()
            .join()
            .await
            .unwrap();
        match &drain(&mut rx)[..] {
            [SessionUpdate::Error(f)] => {
                assert_eq!(f.kind, FailureKind::EntitlementRequired);
                assert_eq!(f.code.as_deref(), Some("trial_expired"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn edit_publishes_snapshot_then_enriched_copy() {
        let server = MockServer::start();
        let edit = server.mock(|when, then| {
            when.method(POST)
                .path("/api/edit-lesson/L1")
                .header("authorization", "Bearer tok-2")
                .json_body(json!({"request": "Make it about Batman"}));
            then.status(200).header("content-type", "text/event-stream").body(concat!(
                "data: {\"type\":\"status\",\"message\":\"Analyzing your request...\"}\n\n",
                "data: {\"type\":\"lesson\",\"lesson\":{\"id\":\"L1\",\"title\":\"Batman Photosynthesis\",\"version\":2}}\n\n",
                "data: {\"type\":\"complete\",\"message\":\"Lesson updated successfully\"}\n\n",
            ));
        });
        let fetch = server.mock(|when, then| {
            when.method(GET).path("/api/lesson/L1").header("authorization", "Bearer tok-2");
            then.status(200).json_body(json!({
                "success": true,
                "lesson": {"id": "L1", "title": "Batman Photosynthesis", "version": 2},
                "images": {"introduction": "data:image/png;base64,BBBB"}
            }));
        });

        let identity = Identity::with_token(SecretString::from("tok-2".to_string()));
        let (obs, mut rx) = ChannelObserver::new();
        let report = client(&server)
            .start_edit(DocumentKind::Lesson, "L1", "Make it about Batman", &identity, obs)
            .unwrap()
            .join()
            .await
            .unwrap();

        edit.assert();
        fetch.assert();
        assert_eq!(report.state, SessionState::Completed);
        assert_eq!(report.images.get("introduction"), Some("data:image/png;base64,BBBB"));
        let docs = drain(&mut rx)
            .into_iter()
            .filter(|u| matches!(u, SessionUpdate::Document { .. }))
            .count();
        assert_eq!(docs, 2);
    }

    #[tokio::test]
    async fn fetch_document_sends_bearer_token() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(GET).path("/api/presentation/P1").header("authorization", "Bearer tok-3");
            then.status(200).json_body(json!({
                "success": true,
                "presentation": {"id": "P1", "title": "Volcanoes", "slides": []}
            }));
        });
        let identity = Identity::with_token(SecretString::from("tok-3".to_string()));
        let doc = client(&server)
            .fetch_document(DocumentKind::Presentation, "P1", &identity)
            .await
            .unwrap();
        m.assert();
        assert_eq!(doc.document.id, "P1");
    }

    #[tokio::test]
    async fn edit_rejects_blank_inputs() {
        let server = MockServer::start();
        let c = client(&server);
        let (obs, _rx) = ChannelObserver::new();
        let id = Identity::anonymous();
        assert!(c.start_edit(DocumentKind::Lesson, " ", "change", &id, obs.clone()).is_err());
        assert!(c.start_edit(DocumentKind::Lesson, "L1", "", &id, obs).is_err());
    }

    #[tokio::test]
    async fn new_session_cancels_the_previous_one() {
        let server = MockServer::start();
        let _slow = server.mock(|when, then| {
            when.method(POST).path("/api/generate-presentation-stream");
            then.status(200).delay(Duration::from_secs(5)).body("");
        });
        let _fast = server.mock(|when, then| {
            when.method(POST).path("/api/generate-lesson-stream");
            then.status(200).body(LESSON_STREAM);
        });

        let c = client(&server);
        let (first_obs, mut first_rx) = ChannelObserver::new();
        let first = c
            .start_generation("Volcanoes", DocumentKind::Presentation, &Identity::anonymous(), first_obs)
            .unwrap();
        let (second_obs, _second_rx) = ChannelObserver::new();
        let second = c
            .start_generation("Photosynthesis", DocumentKind::Lesson, &Identity::anonymous(), second_obs)
            .unwrap();

        assert_eq!(first.join().await.unwrap().state, SessionState::Cancelled);
        assert_eq!(second.join().await.unwrap().state, SessionState::Completed);
        assert!(drain(&mut first_rx).is_empty());
    }

    #[tokio::test]
    async fn fetch_document_reads_envelope() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(GET).path("/api/worksheet/W1");
            then.status(200).json_body(json!({
                "success": true,
                "worksheet": {"id": "W1", "title": "Fractions", "questions": []},
                "images": null
            }));
        });
        let doc = client(&server)
            .fetch_document(DocumentKind::Worksheet, "W1", &Identity::anonymous())
            .await
            .unwrap();
        assert_eq!(doc.document.title, "Fractions");
        assert!(doc.images.is_empty());
    }
}
