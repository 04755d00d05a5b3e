//! Offline Queue Data Models
//!
//! Defines the queued action and the values describing how it reaches the
//! remote API.
//!
//! - OfflineAction: one durable user intent (create/update/delete)
//! - ActionTarget: method, URL and headers of the remote call
//! - ActionPayload: JSON body or raw binary body (attachments)
//! - QueueStatus: snapshot for "N changes pending" indicators

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Enumerations
// ============================================================================

/// Semantic intent of an action (independent of the HTTP verb)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Priority tier. Declaration order is dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl ActionPriority {
    pub const ALL: [ActionPriority; 4] = [Self::Critical, Self::High, Self::Medium, Self::Low];

    /// Rank persisted in the `priority` column (0 dispatches first)
    pub fn rank(&self) -> i64 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(Self::Critical),
            1 => Some(Self::High),
            2 => Some(Self::Medium),
            3 => Some(Self::Low),
            _ => None,
        }
    }

    /// Critical and high work is never evicted to make room
    pub fn is_protected(&self) -> bool {
        matches!(self, Self::Critical | Self::High)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl Default for ActionPriority {
    fn default() -> Self {
        Self::Medium
    }
}

/// Per-action lifecycle state
///
/// `Synced` and `Failed` are terminal and only ever observed in events:
/// the action is removed from the store when it reaches either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Queued,
    Syncing,
    Synced,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "syncing" => Some(Self::Syncing),
            "synced" => Some(Self::Synced),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// HTTP method used to reach the remote collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

// ============================================================================
// Target & Payload
// ============================================================================

/// Where and how an action is delivered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTarget {
    pub url: String,
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ActionTarget {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            headers: BTreeMap::new(),
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Patch, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Body sent with the request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ActionPayload {
    /// No body (typical for DELETE)
    Empty,
    /// JSON document
    Json { body: serde_json::Value },
    /// Raw bytes, e.g. an attachment upload
    Binary {
        content_type: String,
        #[serde(default)]
        file_name: Option<String>,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
}

impl ActionPayload {
    pub fn json(body: serde_json::Value) -> Self {
        Self::Json { body }
    }

    pub fn binary(content_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self::Binary {
            content_type: content_type.into(),
            file_name: None,
            data,
        }
    }
}

/// Binary payloads are stored as base64 inside the JSON payload column
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Offline Action
// ============================================================================

/// Request to queue a new action (producer API input)
#[derive(Debug, Clone)]
pub struct NewAction {
    pub kind: ActionKind,
    pub entity: String,
    pub payload: ActionPayload,
    pub target: ActionTarget,
    pub priority: ActionPriority,
    /// Falls back to the engine default when `None`
    pub max_attempts: Option<u32>,
}

impl NewAction {
    pub fn new(
        kind: ActionKind,
        entity: impl Into<String>,
        payload: ActionPayload,
        target: ActionTarget,
    ) -> Self {
        Self {
            kind,
            entity: entity.into(),
            payload,
            target,
            priority: ActionPriority::default(),
            max_attempts: None,
        }
    }

    pub fn with_priority(mut self, priority: ActionPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Durable queued action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineAction {
    /// Unique for the lifetime of the store; doubles as the idempotency key
    pub id: String,
    pub kind: ActionKind,
    pub entity: String,
    pub payload: ActionPayload,
    pub target: ActionTarget,
    pub priority: ActionPriority,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: ActionStatus,
    pub last_error: Option<String>,
    /// Earliest instant the next attempt may start (`None` = immediately)
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl OfflineAction {
    /// Create a fresh queued action with a new id
    pub fn new(request: NewAction, default_max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: request.kind,
            entity: request.entity,
            payload: request.payload,
            target: request.target,
            priority: request.priority,
            enqueued_at: now,
            attempts: 0,
            max_attempts: request.max_attempts.unwrap_or(default_max_attempts).max(1),
            status: ActionStatus::Queued,
            last_error: None,
            next_attempt_at: None,
            updated_at: now,
        }
    }

    /// Check if the action may be dispatched at `now`
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == ActionStatus::Queued
            && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    pub fn attempts_left(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}

/// Filter for `ActionStore::get_all`; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct ActionFilter {
    pub status: Option<ActionStatus>,
    pub priority: Option<ActionPriority>,
    pub entity: Option<String>,
    /// Only actions eligible at this instant
    pub ready_at: Option<DateTime<Utc>>,
}

impl ActionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Queued actions whose backoff has elapsed at `now`
    pub fn ready(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(ActionStatus::Queued),
            ready_at: Some(now),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: ActionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_priority(mut self, priority: ActionPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }
}

/// Sort into dispatch order: priority tier first, then enqueue time.
///
/// The sort is stable, so actions sharing a timestamp keep store order.
pub fn sort_for_dispatch(actions: &mut [OfflineAction]) {
    actions.sort_by_key(|a| (a.priority, a.enqueued_at));
}

// ============================================================================
// Queue Status
// ============================================================================

/// Snapshot returned by `SyncManager::get_queue_status`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStatus {
    pub total: usize,
    /// Queued and waiting for dispatch
    pub pending: usize,
    /// Currently being dispatched
    pub in_flight: usize,
    pub by_priority: BTreeMap<ActionPriority, usize>,
    pub by_entity: BTreeMap<String, usize>,
    pub oldest_enqueued_at: Option<DateTime<Utc>>,
    pub syncing: bool,
    pub online: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn ticket(priority: ActionPriority) -> OfflineAction {
        OfflineAction::new(
            NewAction::new(
                ActionKind::Create,
                "ticket",
                ActionPayload::json(json!({"title": "X"})),
                ActionTarget::post("https://desk.example.com/api/tickets"),
            )
            .with_priority(priority),
            3,
        )
    }

    #[test]
    fn test_priority_order() {
        assert!(ActionPriority::Critical < ActionPriority::High);
        assert!(ActionPriority::High < ActionPriority::Medium);
        assert!(ActionPriority::Medium < ActionPriority::Low);

        for priority in ActionPriority::ALL {
            assert_eq!(ActionPriority::from_rank(priority.rank()), Some(priority));
        }
        assert!(ActionPriority::from_rank(7).is_none());
    }

    #[test]
    fn test_status_parse() {
        for status in [
            ActionStatus::Queued,
            ActionStatus::Syncing,
            ActionStatus::Synced,
            ActionStatus::Failed,
        ] {
            assert_eq!(ActionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ActionStatus::parse("bogus"), None);
        assert_eq!(ActionStatus::parse(""), None);
    }

    #[test]
    fn test_new_action_defaults() {
        let action = ticket(ActionPriority::High);
        assert_eq!(action.attempts, 0);
        assert_eq!(action.max_attempts, 3);
        assert_eq!(action.status, ActionStatus::Queued);
        assert!(action.is_ready(Utc::now()));
        assert_ne!(action.id, ticket(ActionPriority::High).id);
    }

    #[test]
    fn test_zero_max_attempts_is_clamped() {
        let request = NewAction::new(
            ActionKind::Delete,
            "comment",
            ActionPayload::Empty,
            ActionTarget::delete("https://desk.example.com/api/comments/9"),
        )
        .with_max_attempts(0);

        assert_eq!(OfflineAction::new(request, 3).max_attempts, 1);
    }

    #[test]
    fn test_backoff_blocks_readiness() {
        let mut action = ticket(ActionPriority::Low);
        let now = Utc::now();
        action.next_attempt_at = Some(now + Duration::seconds(30));

        assert!(!action.is_ready(now));
        assert!(action.is_ready(now + Duration::seconds(31)));

        action.status = ActionStatus::Syncing;
        assert!(!action.is_ready(now + Duration::seconds(31)));
    }

    #[test]
    fn test_sort_for_dispatch_is_stable() {
        let base = Utc::now();
        let mut actions: Vec<OfflineAction> = [
            ActionPriority::Low,
            ActionPriority::Critical,
            ActionPriority::Medium,
            ActionPriority::Critical,
        ]
        .into_iter()
        .map(|p| {
            let mut a = ticket(p);
            a.enqueued_at = base;
            a
        })
        .collect();
        let first_critical = actions[1].id.clone();
        let second_critical = actions[3].id.clone();

        sort_for_dispatch(&mut actions);

        let order: Vec<_> = actions.iter().map(|a| a.priority).collect();
        assert_eq!(
            order,
            vec![
                ActionPriority::Critical,
                ActionPriority::Critical,
                ActionPriority::Medium,
                ActionPriority::Low
            ]
        );
        assert_eq!(actions[0].id, first_critical);
        assert_eq!(actions[1].id, second_critical);
    }

    #[test]
    fn test_binary_payload_serializes_as_base64() {
        let payload = ActionPayload::binary("image/png", vec![0x89, 0x50, 0x4e, 0x47]);
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["type"], "binary");
        assert_eq!(json["data"], "iVBORw==");

        let back: ActionPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }
}
