use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::event::{EventData, Phase, ProxyErrorPayload};
use crate::ids::{EventId, RequestId, SubscriptionId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticResponse {
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl StaticResponse {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }
}

impl Default for StaticResponse {
    fn default() -> Self {
        Self::new(200)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ReplyOutcome {
    Continue,
    Mutate { data: EventData },
    Respond { response: StaticResponse },
    Destroy,
    Error { error: ProxyErrorPayload },
    Aborted,
}

impl ReplyOutcome {
    pub fn handler_failure(message: &str) -> Self {
        ReplyOutcome::Error {
            error: ProxyErrorPayload {
                name: "HandlerFailure".to_string(),
                message: message.to_string(),
            },
        }
    }
}

/// A continuation the proxy must emit a matching event for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionGrant {
    pub id: SubscriptionId,
    pub phase: Phase,
    #[serde(rename = "await")]
    pub awaiting: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyReply {
    pub event_id: EventId,
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<SubscriptionId>,
    pub phase: Phase,
    pub awaited: bool,
    pub outcome: ReplyOutcome,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subscribe: Vec<SubscriptionGrant>,
}
