//! Generation events, normalized from the wire's `type`-tagged JSON objects.
//!
//! Contract:
//! - A session sees `Init`, then one `DocumentReady`, then 0..n `ImageReady`
//!   and `StatusUpdate` events, and ends with exactly one terminal event:
//!   `Complete` or `Failure`.
//! - The producer is not trusted to follow this order; the folder in
//!   `crate::session` tolerates images before the document.
//! - Kind-named document fields (`lesson`, `presentation`, `worksheet`) are
//!   resolved here, so nothing downstream looks at raw wire field names.

use serde_json::{Map, Value};

use crate::error::{CoreResult, DoodlepadError};
use crate::model::{DocumentKind, PartialDocument};

/// Machine codes that mean the caller lacks a subscription or trial.
pub const ENTITLEMENT_CODES: &[&str] = &["subscription_required", "trial_expired"];

/// Reason used for failures the producer did not describe (transport drops, bad status).
pub const GENERIC_FAILURE_REASON: &str = "An error occurred while generating content. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Block further attempts and offer an upgrade.
    EntitlementRequired,
    /// Anything else; the caller may retry.
    Generic,
}

/// Terminal error outcome of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub reason: String,
    pub code: Option<String>,
    pub kind: FailureKind,
}

impl Failure {
    /// Classify by code: a recognized entitlement code wins, anything else is generic.
    pub fn new(reason: impl Into<String>, code: Option<String>) -> Self {
        let kind = match code.as_deref() {
            Some(c) if ENTITLEMENT_CODES.contains(&c) => FailureKind::EntitlementRequired,
            _ => FailureKind::Generic,
        };
        Self {
            reason: reason.into(),
            code,
            kind,
        }
    }

    pub fn generic(reason: impl Into<String>) -> Self {
        Self::new(reason, None)
    }

    pub fn is_entitlement(&self) -> bool {
        self.kind == FailureKind::EntitlementRequired
    }
}

impl From<&DoodlepadError> for Failure {
    fn from(err: &DoodlepadError) -> Self {
        match err {
            DoodlepadError::EntitlementRequired { code } => Failure {
                reason: GENERIC_FAILURE_REASON.to_string(),
                code: Some(code.clone()),
                kind: FailureKind::EntitlementRequired,
            },
            _ => Failure::generic(GENERIC_FAILURE_REASON),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    /// Stream opened. The producer may announce the id it assigned.
    Init { document_id: Option<String> },
    /// Full structural snapshot of the document, without images.
    DocumentReady { document: PartialDocument },
    /// One image for a slot key.
    ImageReady { key: String, image_data: String },
    /// Progress text with no structural effect.
    StatusUpdate { message: String },
    /// Terminal success. Edit completions may carry the final document.
    Complete {
        message: String,
        document: Option<PartialDocument>,
    },
    /// Terminal error.
    Failure(Failure),
}

impl GenerationEvent {
    /// Returns true if this event closes the session (`Complete` or `Failure`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Failure(_))
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::DocumentReady { .. } => "document",
            Self::ImageReady { .. } => "image",
            Self::StatusUpdate { .. } => "status",
            Self::Complete { .. } => "complete",
            Self::Failure(_) => "error",
        }
    }

    /// Normalize one decoded frame.
    ///
    /// Returns `Ok(None)` for frames with an unrecognized `type`, which are
    /// skipped. A recognized type with a malformed payload is an error.
    pub fn from_value(value: Value) -> CoreResult<Option<Self>> {
        let Value::Object(mut obj) = value else {
            return Err(DoodlepadError::Decode("event is not a JSON object".into()));
        };
        let ty = match obj.get("type") {
            Some(Value::String(s)) => s.clone(),
            // The producer reports request validation problems as a bare `{"error": ...}`.
            None if obj.contains_key("error") => "error".to_string(),
            Some(_) => return Err(DoodlepadError::Decode("event type is not a string".into())),
            None => return Err(DoodlepadError::Decode("event has no type".into())),
        };

        let event = match ty.as_str() {
            "init" => Self::Init {
                document_id: id_field(&obj),
            },
            "image" => Self::ImageReady {
                key: required_str(&mut obj, "key")?,
                image_data: required_str(&mut obj, "image")?,
            },
            "status" => Self::StatusUpdate {
                message: optional_str(&mut obj, "message").unwrap_or_default(),
            },
            "complete" => {
                let document = match take_document(&mut obj) {
                    Some((kind, body)) => Some(PartialDocument::from_value(kind, body)?),
                    None => None,
                };
                Self::Complete {
                    message: optional_str(&mut obj, "message").unwrap_or_default(),
                    document,
                }
            }
            "error" => Self::Failure(failure_from(&mut obj)),
            other => match DocumentKind::from_wire(other) {
                Some(kind) => {
                    let body = obj.remove(kind.as_str()).ok_or_else(|| {
                        DoodlepadError::Decode(format!("'{kind}' event has no '{kind}' field"))
                    })?;
                    Self::DocumentReady {
                        document: PartialDocument::from_value(kind, body)?,
                    }
                }
                None => {
                    tracing::debug!(event_type = other, "skipping unknown event type");
                    return Ok(None);
                }
            },
        };
        Ok(Some(event))
    }
}

fn id_field(obj: &Map<String, Value>) -> Option<String> {
    ["lesson_id", "presentation_id", "worksheet_id", "id"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

fn optional_str(obj: &mut Map<String, Value>, key: &str) -> Option<String> {
    match obj.remove(key) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

fn required_str(obj: &mut Map<String, Value>, key: &str) -> CoreResult<String> {
    optional_str(obj, key).ok_or_else(|| DoodlepadError::Decode(format!("event field '{key}' missing")))
}

fn take_document(obj: &mut Map<String, Value>) -> Option<(DocumentKind, Value)> {
    DocumentKind::ALL
        .into_iter()
        .find_map(|k| obj.remove(k.as_str()).filter(|v| !v.is_null()).map(|v| (k, v)))
}

/// `error` events put the text in `message` or `error`. A recognized
/// entitlement code may appear in `code` or as the `error` text itself.
fn failure_from(obj: &mut Map<String, Value>) -> Failure {
    let message = optional_str(obj, "message");
    let error = optional_str(obj, "error");
    let code = optional_str(obj, "code").or_else(|| {
        error
            .as_deref()
            .filter(|e| ENTITLEMENT_CODES.contains(e))
            .map(str::to_string)
    });
    let reason = message
        .or(error)
        .unwrap_or_else(|| GENERIC_FAILURE_REASON.to_string());
    Failure::new(reason, code)
}
