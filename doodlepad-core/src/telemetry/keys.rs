/// Span/Log attribute keys for stream sessions.
/// Keep these stable; changing them is a breaking change for dashboards.
pub const KEY_SESSION_ID: &str = "session.id";
pub const KEY_CONTENT_KIND: &str = "content.kind";
pub const KEY_SESSION_MODE: &str = "session.mode"; // "generate" | "edit"
pub const KEY_OUTCOME: &str = "session.outcome";

pub const KEY_EVENTS_FOLDED: &str = "events.folded";
pub const KEY_IMAGES_COUNT: &str = "images.count";
pub const KEY_FRAMES_DROPPED: &str = "frames.dropped";
pub const KEY_LATENCY_MS: &str = "latency.ms";

/// Failure-related (if applicable)
pub const KEY_FAILURE_KIND: &str = "failure.kind";
pub const KEY_FAILURE_CODE: &str = "failure.code";
