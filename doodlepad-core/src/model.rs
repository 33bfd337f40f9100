use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreResult, DoodlepadError};

/// Which shape of content a document has. Selects routes and the
/// kind-named field the document travels under on the wire.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Lesson,
    Presentation,
    Worksheet,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 3] = [Self::Lesson, Self::Presentation, Self::Worksheet];

    /// Wire name, used both as the event `type` and as the document field.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lesson => "lesson",
            Self::Presentation => "presentation",
            Self::Worksheet => "worksheet",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    pub fn generate_path(self) -> String {
        format!("/generate-{}-stream", self.as_str())
    }

    pub fn edit_path(self, document_id: &str) -> String {
        format!("/edit-{}/{}", self.as_str(), document_id)
    }

    pub fn fetch_path(self, document_id: &str) -> String {
        format!("/{}/{}", self.as_str(), document_id)
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentKind {
    type Err = DoodlepadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_wire(&s.to_ascii_lowercase())
            .ok_or_else(|| DoodlepadError::Validation(format!("unknown document kind '{s}'")))
    }
}

/// The evolving generated document. Only the envelope fields are read;
/// everything else stays in `body` untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialDocument {
    pub kind: DocumentKind,
    pub id: String,
    pub title: String,
    pub version: u64,
    /// The complete JSON object as received, envelope fields included.
    pub body: Value,
}

impl PartialDocument {
    /// Normalize a kind-tagged JSON object into a document.
    /// Requires an object with a string `id`; `title` and `version` are optional.
    pub fn from_value(kind: DocumentKind, body: Value) -> CoreResult<Self> {
        let obj = body
            .as_object()
            .ok_or_else(|| DoodlepadError::Decode(format!("{kind} payload is not an object")))?;
        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| DoodlepadError::Decode(format!("{kind} payload has no string id")))?
            .to_string();
        let title = obj
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let version = obj.get("version").and_then(Value::as_u64).unwrap_or(0);
        Ok(Self {
            kind,
            id,
            title,
            version,
            body,
        })
    }
}

/// Slot key -> displayable image payload (usually a data URI).
///
/// Copy-on-write: `with_image` returns a new map backed by a fresh
/// allocation, so observers can detect a change with `ptr_eq`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct ImageMap {
    inner: Arc<BTreeMap<String, String>>,
}

impl ImageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// New map with `key` set to `image_data`; a previous value for the key is replaced.
    pub fn with_image(&self, key: impl Into<String>, image_data: impl Into<String>) -> Self {
        let mut next = (*self.inner).clone();
        next.insert(key.into(), image_data.into());
        Self {
            inner: Arc::new(next),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.inner.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// New map holding both key sets; values from `other` win.
    pub fn merged(&self, other: &ImageMap) -> Self {
        let mut next = (*self.inner).clone();
        next.extend(other.inner.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self {
            inner: Arc::new(next),
        }
    }

    /// True when both maps share the same allocation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for ImageMap {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl From<BTreeMap<String, String>> for ImageMap {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self {
            inner: Arc::new(map),
        }
    }
}

impl From<ImageMap> for BTreeMap<String, String> {
    fn from(map: ImageMap) -> Self {
        Arc::unwrap_or_clone(map.inner)
    }
}

/// Body of a generation request.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct GenerateBody {
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Body of an edit request.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct EditBody {
    pub request: String,
}

/// A document plus its images, as returned by a companion read.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedDocument {
    pub document: PartialDocument,
    pub images: ImageMap,
}

impl EnrichedDocument {
    /// Parse the `{ success, <kind>: {...}, images: {...} }` envelope.
    pub fn from_envelope(kind: DocumentKind, envelope: Value) -> CoreResult<Self> {
        let Value::Object(mut obj) = envelope else {
            return Err(DoodlepadError::Decode("document envelope is not an object".into()));
        };
        if obj.get("success").and_then(Value::as_bool) != Some(true) {
            let reason = obj
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("success flag missing or false");
            return Err(DoodlepadError::Decode(format!("{kind} fetch unsuccessful: {reason}")));
        }
        let body = obj
            .remove(kind.as_str())
            .ok_or_else(|| DoodlepadError::Decode(format!("envelope has no '{kind}' field")))?;
        let document = PartialDocument::from_value(kind, body)?;
        let images = match obj.remove("images") {
            None | Some(Value::Null) => ImageMap::new(),
            Some(v) => serde_json::from_value::<ImageMap>(v)
                .map_err(|e| DoodlepadError::Decode(format!("images: {e}")))?,
        };
        Ok(Self { document, images })
    }
}
