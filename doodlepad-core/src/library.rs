//! Saved resources and subscription status for a signed-in user.

use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::Config;
use crate::error::{CoreResult, DoodlepadError};
use crate::http_client::{HttpClient, RequestCtx};
use crate::model::{DocumentKind, ImageMap};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Lesson,
    Worksheet,
    Presentation,
    Curriculum,
    Flashcard,
    Quiz,
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lesson => "lesson",
            Self::Worksheet => "worksheet",
            Self::Presentation => "presentation",
            Self::Curriculum => "curriculum",
            Self::Flashcard => "flashcard",
            Self::Quiz => "quiz",
        }
    }
}

impl From<DocumentKind> for ResourceType {
    fn from(kind: DocumentKind) -> Self {
        match kind {
            DocumentKind::Lesson => Self::Lesson,
            DocumentKind::Presentation => Self::Presentation,
            DocumentKind::Worksheet => Self::Worksheet,
        }
    }
}

impl std::str::FromStr for ResourceType {
    type Err = DoodlepadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_ascii_lowercase()))
            .map_err(|_| DoodlepadError::Validation(format!("unknown resource type '{s}'")))
    }
}

/// A resource to save.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct NewResource {
    pub resource_type: ResourceType,
    pub title: String,
    pub content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<ImageMap>,
}

/// A saved resource as the backend returns it.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Resource {
    pub id: String,
    pub resource_type: ResourceType,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub images: Option<ImageMap>,
    #[serde(default)]
    pub assigned_students: Vec<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceFilter {
    pub resource_type: Option<ResourceType>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for ResourceFilter {
    fn default() -> Self {
        Self {
            resource_type: None,
            limit: 50,
            offset: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    Lifetime,
    Active,
    Trial,
    Expired,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SubscriptionStatus {
    pub subscription_status: SubscriptionState,
    #[serde(default)]
    pub subscription_type: Option<String>,
    #[serde(default)]
    pub can_create_content: bool,
    #[serde(default)]
    pub days_remaining: Option<u32>,
    #[serde(default)]
    pub trial_end_date: Option<String>,
}

/// `{ success, error?, ...payload }`
#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(flatten)]
    data: T,
}

impl<T> Envelope<T> {
    fn into_data(self, what: &str) -> CoreResult<T> {
        if self.success {
            Ok(self.data)
        } else {
            Err(DoodlepadError::Decode(format!(
                "{what}: {}",
                self.error.as_deref().unwrap_or("success flag missing or false")
            )))
        }
    }
}

#[derive(Deserialize)]
struct Saved {
    resource_id: String,
}

#[derive(Deserialize)]
struct One {
    resource: Resource,
}

#[derive(Deserialize)]
struct Many {
    #[serde(default)]
    resources: Vec<Resource>,
}

#[derive(Deserialize)]
struct Status {
    status: SubscriptionStatus,
}

#[derive(Deserialize)]
struct Ack {}

/// Bearer-authenticated client for the saved-resource library.
#[derive(Clone)]
pub struct LibraryClient {
    http: HttpClient,
    base_url: String,
    token: Option<SecretString>,
}

impl LibraryClient {
    pub fn new(cfg: &Config, token: Option<SecretString>) -> CoreResult<Self> {
        Ok(Self::with_base(HttpClient::new(&cfg.http)?, &cfg.api.base_url, token))
    }

    pub fn with_base(http: HttpClient, base_url: impl Into<String>, token: Option<SecretString>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Every library call needs an identity; fail before touching the network.
    fn ctx(&self) -> CoreResult<RequestCtx<'_>> {
        match &self.token {
            Some(token) => Ok(RequestCtx {
                bearer: Some(token),
                request_id: None,
            }),
            None => Err(DoodlepadError::Validation("sign-in required: no identity token".into())),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn resource_url(&self, id: &str, suffix: &str) -> CoreResult<String> {
        let id = id.trim();
        if id.is_empty() {
            return Err(DoodlepadError::Validation("resource id must not be empty".into()));
        }
        Ok(self.url(&format!("/resources/{id}{suffix}")))
    }

    async fn get<T: DeserializeOwned>(&self, url: &str, what: &str) -> CoreResult<T> {
        let ctx = self.ctx()?;
        let env: Envelope<T> = self.http.get_json(url, &ctx).await?;
        env.into_data(what)
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, url: &str, body: &B, what: &str) -> CoreResult<T> {
        let ctx = self.ctx()?;
        let env: Envelope<T> = self.http.post_json(url, body, &ctx).await?;
        env.into_data(what)
    }

    /// Returns the new resource id.
    pub async fn save_resource(&self, resource: &NewResource) -> CoreResult<String> {
        if resource.title.trim().is_empty() {
            return Err(DoodlepadError::Validation("resource title must not be empty".into()));
        }
        let saved: Saved = self.post(&self.url("/resources"), resource, "save resource").await?;
        tracing::info!(resource_id = %saved.resource_id, resource_type = resource.resource_type.as_str(), "resource saved");
        Ok(saved.resource_id)
    }

    pub async fn get_resource(&self, id: &str) -> CoreResult<Resource> {
        let one: One = self.get(&self.resource_url(id, "")?, "get resource").await?;
        Ok(one.resource)
    }

    pub async fn list_resources(&self, filter: &ResourceFilter) -> CoreResult<Vec<Resource>> {
        let mut path = format!("/resources?limit={}&offset={}", filter.limit, filter.offset);
        if let Some(t) = filter.resource_type {
            path.push_str("&type=");
            path.push_str(t.as_str());
        }
        let many: Many = self.get(&self.url(&path), "list resources").await?;
        Ok(many.resources)
    }

    /// Merge `patch` into the stored resource. The backend ignores `id`,
    /// `user_id` and `created_at`.
    pub async fn update_resource(&self, id: &str, patch: &Value) -> CoreResult<()> {
        if !patch.is_object() {
            return Err(DoodlepadError::Validation("resource update must be a JSON object".into()));
        }
        let url = self.resource_url(id, "")?;
        let ctx = self.ctx()?;
        let env: Envelope<Ack> = self.http.put_json(&url, patch, &ctx).await?;
        env.into_data("update resource").map(|_| ())
    }

    pub async fn delete_resource(&self, id: &str) -> CoreResult<()> {
        let url = self.resource_url(id, "")?;
        let ctx = self.ctx()?;
        let env: Envelope<Ack> = self.http.delete_json(&url, &ctx).await?;
        env.into_data("delete resource")?;
        tracing::info!(resource_id = id, "resource deleted");
        Ok(())
    }

    pub async fn assign_resource(&self, id: &str, student_id: &str) -> CoreResult<()> {
        self.assignment(id, student_id, "/assign").await
    }

    pub async fn unassign_resource(&self, id: &str, student_id: &str) -> CoreResult<()> {
        self.assignment(id, student_id, "/unassign").await
    }

    async fn assignment(&self, id: &str, student_id: &str, action: &str) -> CoreResult<()> {
        let student_id = student_id.trim();
        if student_id.is_empty() {
            return Err(DoodlepadError::Validation("student id must not be empty".into()));
        }
        let url = self.resource_url(id, action)?;
        let _: Ack = self
            .post(&url, &json!({ "student_id": student_id }), action.trim_start_matches('/'))
            .await?;
        Ok(())
    }

    pub async fn subscription_status(&self) -> CoreResult<SubscriptionStatus> {
        let status: Status = self.get(&self.url("/subscription/status"), "subscription status").await?;
        Ok(status.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::{DELETE, GET, POST, PUT};
    use httpmock::MockServer;

    fn library(server: &MockServer) -> LibraryClient {
        LibraryClient::with_base(
            HttpClient::new_default().unwrap(),
            server.url("/api"),
            Some(SecretString::from("tok-1".to_string())),
        )
    }

    #[tokio::test]
    async fn missing_token_fails_before_any_request() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(GET).path("/api/resources");
            then.status(200).json_body(json!({"success": true, "resources": []}));
        });
        let anon = LibraryClient::with_base(HttpClient::new_default().unwrap(), server.url("/api"), None);
        let err = anon.list_resources(&ResourceFilter::default()).await.unwrap_err();
        assert!(matches!(err, DoodlepadError::Validation(_)));
        assert!(matches!(anon.subscription_status().await, Err(DoodlepadError::Validation(_))));
        assert_eq!(m.hits(), 0);
    }

    #[tokio::test]
    async fn save_posts_resource_and_returns_id() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/api/resources")
                .header("authorization", "Bearer tok-1")
                .json_body(json!({
                    "resource_type": "lesson",
                    "title": "Photosynthesis",
                    "content": {"id": "L1"},
                    "images": {"introduction": "data:x"}
                }));
            then.status(200)
                .json_body(json!({"success": true, "resource_id": "R1", "message": "Resource saved successfully"}));
        });
        let id = library(&server)
            .save_resource(&NewResource {
                resource_type: DocumentKind::Lesson.into(),
                title: "Photosynthesis".into(),
                content: json!({"id": "L1"}),
                images: Some(ImageMap::new().with_image("introduction", "data:x")),
            })
            .await
            .unwrap();
        assert_eq!(id, "R1");
        m.assert();
    }

    #[tokio::test]
    async fn list_sends_paging_and_type() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(GET)
                .path("/api/resources")
                .query_param("limit", "50")
                .query_param("offset", "0")
                .query_param("type", "worksheet");
            then.status(200).json_body(json!({
                "success": true,
                "count": 1,
                "resources": [{
                    "id": "R2",
                    "resource_type": "worksheet",
                    "title": "Fractions",
                    "content": {},
                    "assigned_students": ["s1"],
                    "created_at": "Tue, 14 Oct 2025 10:00:00 GMT"
                }]
            }));
        });
        let filter = ResourceFilter {
            resource_type: Some(ResourceType::Worksheet),
            ..ResourceFilter::default()
        };
        let items = library(&server).list_resources(&filter).await.unwrap();
        m.assert();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].resource_type, ResourceType::Worksheet);
        assert_eq!(items[0].assigned_students, vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn get_missing_resource_is_status_error() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(GET).path("/api/resources/nope");
            then.status(404).json_body(json!({"error": "Resource not found"}));
        });
        match library(&server).get_resource("nope").await.unwrap_err() {
            DoodlepadError::Status { code, message } => {
                assert_eq!(code, 404);
                assert!(message.contains("Resource not found"));
            }
            other => panic!("expected Status, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn update_delete_and_assignment_round_out_crud() {
        let server = MockServer::start();
        let put = server.mock(|when, then| {
            when.method(PUT).path("/api/resources/R1").json_body(json!({"title": "New title"}));
            then.status(200).json_body(json!({"success": true, "message": "Resource updated successfully"}));
        });
        let assign = server.mock(|when, then| {
            when.method(POST).path("/api/resources/R1/assign").json_body(json!({"student_id": "s1"}));
            then.status(200).json_body(json!({"success": true}));
        });
        let unassign = server.mock(|when, then| {
            when.method(POST).path("/api/resources/R1/unassign").json_body(json!({"student_id": "s1"}));
            then.status(200).json_body(json!({"success": true}));
        });
        let delete = server.mock(|when, then| {
            when.method(DELETE).path("/api/resources/R1");
            then.status(200).json_body(json!({"success": true, "message": "Resource deleted successfully"}));
        });

        let lib = library(&server);
        lib.update_resource("R1", &json!({"title": "New title"})).await.unwrap();
        lib.assign_resource("R1", "s1").await.unwrap();
        lib.unassign_resource("R1", "s1").await.unwrap();
        lib.delete_resource("R1").await.unwrap();
        put.assert();
        assign.assert();
        unassign.assert();
        delete.assert();

        assert!(matches!(lib.update_resource("R1", &json!([1])).await, Err(DoodlepadError::Validation(_))));
        assert!(matches!(lib.assign_resource("R1", " ").await, Err(DoodlepadError::Validation(_))));
    }

    #[tokio::test]
    async fn unsuccessful_envelope_is_decode_error() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(DELETE).path("/api/resources/R1");
            then.status(200).json_body(json!({"success": false, "error": "Failed to delete resource"}));
        });
        match library(&server).delete_resource("R1").await.unwrap_err() {
            DoodlepadError::Decode(msg) => assert!(msg.contains("Failed to delete resource")),
            other => panic!("expected Decode, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn subscription_status_parses_trial() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(GET).path("/api/subscription/status").header("authorization", "Bearer tok-1");
            then.status(200).json_body(json!({
                "success": true,
                "status": {
                    "subscription_status": "trial",
                    "days_remaining": 5,
                    "can_create_content": true,
                    "trial_end_date": "Sun, 19 Oct 2025 00:00:00 GMT"
                }
            }));
        });
        let status = library(&server).subscription_status().await.unwrap();
        assert_eq!(status.subscription_status, SubscriptionState::Trial);
        assert_eq!(status.days_remaining, Some(5));
        assert!(status.can_create_content);
    }

    #[test]
    fn resource_type_parses_case_insensitively() {
        assert_eq!("Quiz".parse::<ResourceType>().unwrap(), ResourceType::Quiz);
        assert!("essay".parse::<ResourceType>().is_err());
    }
}
