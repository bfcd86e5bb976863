use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// One delivery medium. The set is closed: dispatch is an explicit match on
/// this enum, never a string lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Inapp,
    Push,
    Email,
    Sms,
    Zalo,
    Viber,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::Inapp,
        Channel::Push,
        Channel::Email,
        Channel::Sms,
        Channel::Zalo,
        Channel::Viber,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Inapp => "inapp",
            Channel::Push => "push",
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Zalo => "zalo",
            Channel::Viber => "viber",
        }
    }

    pub fn parse(s: &str) -> Option<Channel> {
        match s {
            "inapp" => Some(Channel::Inapp),
            "push" => Some(Channel::Push),
            "email" => Some(Channel::Email),
            "sms" => Some(Channel::Sms),
            "zalo" => Some(Channel::Zalo),
            "viber" => Some(Channel::Viber),
            _ => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channels dispatched when neither the job nor the template names any.
pub const DEFAULT_CHANNELS: [Channel; 2] = [Channel::Inapp, Channel::Push];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Processing,
    Failed,
    Done,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Processing => "processing",
            JobStatus::Failed => "failed",
            JobStatus::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<JobStatus> {
        match s {
            "created" => Some(JobStatus::Created),
            "processing" => Some(JobStatus::Processing),
            "failed" => Some(JobStatus::Failed),
            "done" => Some(JobStatus::Done),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
    Skipped,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<DeliveryStatus> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "sent" => Some(DeliveryStatus::Sent),
            "delivered" => Some(DeliveryStatus::Delivered),
            "read" => Some(DeliveryStatus::Read),
            "failed" => Some(DeliveryStatus::Failed),
            "skipped" => Some(DeliveryStatus::Skipped),
            _ => None,
        }
    }
}

/// Who a job addresses. Only `user` is resolvable today; other kinds are an
/// extension point handled by the audience resolver registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audience {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

impl Audience {
    pub fn user(uid: impl Into<String>) -> Self {
        Audience {
            kind: "user".to_string(),
            uid: Some(uid.into()),
            topic: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationJob {
    pub id: String,
    pub template_id: String,
    pub audience: Audience,
    pub data: Value,
    pub required_channels: Option<Vec<Channel>>,
    pub topic: Option<String>,
    pub status: JobStatus,
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Localized title/body plus the default channel set. Language maps are
/// ordered so fallback to "any available language" is deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub title: BTreeMap<String, String>,
    pub body: BTreeMap<String, String>,
    pub channels: Vec<Channel>,
}

/// Local-time window in which provider sends are deferred. Boundaries are
/// "HH:MM" strings; a missing or malformed boundary disables the window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: Option<String>,
    pub end: Option<String>,
}

impl QuietHours {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        QuietHours {
            start: Some(start.into()),
            end: Some(end.into()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactInfo {
    pub email: Option<String>,
    pub phone: Option<String>,
    #[serde(default)]
    pub fcm_tokens: Vec<String>,
    pub zalo_user_id: Option<String>,
    pub viber_user_id: Option<String>,
}

impl ContactInfo {
    /// Record a chat user id under the matching provider field. Returns
    /// false for providers without a contact slot.
    pub fn set_chat_user_id(&mut self, provider: &str, external_id: &str) -> bool {
        match provider {
            "zalo" => {
                self.zalo_user_id = Some(external_id.to_string());
                true
            }
            "viber" => {
                self.viber_user_id = Some(external_id.to_string());
                true
            }
            _ => false,
        }
    }
}

/// Per-user delivery preferences. Absence of a record means the user is
/// skipped entirely; this subsystem never writes it except for the chat
/// contact fields set during link redemption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPreference {
    pub uid: String,
    pub language: String,
    pub timezone: String,
    pub quiet_hours: Option<QuietHours>,
    pub contact: ContactInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub source: String,
    pub event: String,
    pub raw: Value,
    pub at: DateTime<Utc>,
}

/// One row per (job, channel, recipient) attempt. The id is deterministic,
/// so repeated worker invocations overwrite instead of duplicating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: String,
    pub job_id: String,
    pub uid: Option<String>,
    pub channel: Channel,
    pub status: DeliveryStatus,
    pub provider: Option<String>,
    pub provider_message_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub meta: Option<Value>,
    #[serde(default)]
    pub events: Vec<DeliveryEvent>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

/// Deterministic ledger key: the same (job, channel, recipient) always maps
/// to the same row. Hashed so recipient keys with arbitrary characters stay
/// storage-safe.
pub fn delivery_id(job_id: &str, channel: Channel, recipient_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job_id.as_bytes());
    hasher.update(b":");
    hasher.update(channel.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(recipient_key.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkCode {
    pub code: String,
    pub uid: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub used_by_external_id: Option<String>,
}

/// Reverse index from an external chat identity (keyed per provider) to an
/// internal user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatIdentity {
    pub provider: String,
    pub external_id: String,
    pub uid: Option<String>,
    pub followed: bool,
    pub last_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Singleton OAuth credential per provider; written only by the refresher,
/// read by every send attempt on that channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokenRecord {
    pub provider: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// The user-facing in-app record, distinct from the Delivery ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxNotification {
    pub id: String,
    pub uid: String,
    pub job_id: String,
    pub title: String,
    pub body: String,
    pub action_url: Option<String>,
    pub topic: Option<String>,
    pub read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Durable work item for one deferred (recipient, channel) send, consumed by
/// the sweeper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxItem {
    pub id: i64,
    pub job_id: String,
    pub uid: String,
    pub channel: Channel,
    pub payload: OutboxPayload,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub dead: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxPayload {
    pub payload: MessagePayload,
    pub target: SendTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

/// Rendered message content handed to a channel worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_url: Option<String>,
}

/// Channel-specific addressing. Built from the recipient's contact record by
/// the orchestrator, or parsed from the raw `target` object of a worker
/// request. Emptiness is the provider adapter's concern: an empty target
/// yields a `skipped` result, not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SendTarget {
    Push {
        tokens: Vec<String>,
        topic: Option<String>,
    },
    Email {
        to: String,
    },
    Sms {
        to: String,
    },
    Chat {
        external_user_id: String,
    },
}

impl SendTarget {
    /// Target for a provider-backed channel from the user's contact record.
    /// `None` only for the in-app channel, which has no provider.
    pub fn from_contact(
        channel: Channel,
        contact: &ContactInfo,
        topic: Option<&str>,
    ) -> Option<SendTarget> {
        match channel {
            Channel::Inapp => None,
            Channel::Push => Some(SendTarget::Push {
                tokens: contact.fcm_tokens.clone(),
                topic: topic.map(|t| t.to_string()),
            }),
            Channel::Email => Some(SendTarget::Email {
                to: contact.email.clone().unwrap_or_default(),
            }),
            Channel::Sms => Some(SendTarget::Sms {
                to: contact.phone.clone().unwrap_or_default(),
            }),
            Channel::Zalo => Some(SendTarget::Chat {
                external_user_id: contact.zalo_user_id.clone().unwrap_or_default(),
            }),
            Channel::Viber => Some(SendTarget::Chat {
                external_user_id: contact.viber_user_id.clone().unwrap_or_default(),
            }),
        }
    }

    /// Target from the loose `target` object of an HTTP worker request.
    /// Unknown or missing fields collapse to an empty target.
    pub fn from_value(channel: Channel, target: Option<&Value>, topic: Option<&str>) -> Option<SendTarget> {
        let str_field = |name: &str| -> Option<String> {
            target
                .and_then(|t| t.get(name))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };
        match channel {
            Channel::Inapp => None,
            Channel::Push => {
                let tokens = target
                    .and_then(|t| t.get("tokens"))
                    .and_then(|v| v.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|v| v.as_str())
                            .map(|s| s.to_string())
                            .collect()
                    })
                    .unwrap_or_default();
                let topic = topic
                    .map(|t| t.to_string())
                    .or_else(|| str_field("topic"));
                Some(SendTarget::Push { tokens, topic })
            }
            Channel::Email => Some(SendTarget::Email {
                to: str_field("to").unwrap_or_default(),
            }),
            Channel::Sms => Some(SendTarget::Sms {
                to: str_field("to").unwrap_or_default(),
            }),
            Channel::Zalo | Channel::Viber => Some(SendTarget::Chat {
                external_user_id: str_field("externalUserId").unwrap_or_default(),
            }),
        }
    }

    /// Loose `target` object for a worker request, the inverse of
    /// [`SendTarget::from_value`].
    pub fn to_request_value(&self) -> Value {
        match self {
            SendTarget::Push { tokens, topic } => {
                let mut obj = serde_json::json!({ "tokens": tokens });
                if let Some(topic) = topic {
                    obj["topic"] = Value::String(topic.clone());
                }
                obj
            }
            SendTarget::Email { to } | SendTarget::Sms { to } => {
                serde_json::json!({ "to": to })
            }
            SendTarget::Chat { external_user_id } => {
                serde_json::json!({ "externalUserId": external_user_id })
            }
        }
    }

    /// Primary address, used as the recipient key when no uid is known.
    pub fn recipient_key(&self) -> Option<&str> {
        match self {
            SendTarget::Push { tokens, topic } => tokens
                .first()
                .map(|s| s.as_str())
                .or(topic.as_deref()),
            SendTarget::Email { to } | SendTarget::Sms { to } => {
                if to.is_empty() {
                    None
                } else {
                    Some(to)
                }
            }
            SendTarget::Chat { external_user_id } => {
                if external_user_id.is_empty() {
                    None
                } else {
                    Some(external_user_id)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    Sent,
    Failed,
    Skipped,
}

/// Canonical verdict of one provider call: the provider answered and said
/// sent, failed, or skipped. Transport-level trouble is not a verdict and
/// travels as an error instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderResult {
    pub provider: String,
    pub status: SendStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl ProviderResult {
    pub fn sent(provider: &str, message_id: Option<String>) -> Self {
        ProviderResult {
            provider: provider.to_string(),
            status: SendStatus::Sent,
            provider_message_id: message_id,
            error_code: None,
            error_message: None,
            meta: None,
        }
    }

    pub fn failed(provider: &str, code: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderResult {
            provider: provider.to_string(),
            status: SendStatus::Failed,
            provider_message_id: None,
            error_code: Some(code.into()),
            error_message: Some(message.into()),
            meta: None,
        }
    }

    pub fn skipped(provider: &str, code: impl Into<String>) -> Self {
        ProviderResult {
            provider: provider.to_string(),
            status: SendStatus::Skipped,
            provider_message_id: None,
            error_code: Some(code.into()),
            error_message: None,
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Extra context handed to provider adapters for logging and metadata.
#[derive(Debug, Clone)]
pub struct SendContext {
    pub job_id: String,
    pub uid: Option<String>,
}

/// Body of a channel worker invocation (HTTP or in-process).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    pub payload: MessagePayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResponse {
    pub ok: bool,
    pub result: ProviderResult,
    pub delivery_id: String,
}
