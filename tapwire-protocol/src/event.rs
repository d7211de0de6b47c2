use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::ids::{EventId, RequestId, RouteHandlerId, SubscriptionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    #[serde(rename = "before:request")]
    BeforeRequest,
    #[serde(rename = "response")]
    Response,
    #[serde(rename = "after:response")]
    AfterResponse,
}

impl Phase {
    pub fn event_name(&self) -> &'static str {
        match self {
            Phase::BeforeRequest => "before:request",
            Phase::Response => "response",
            Phase::AfterResponse => "after:response",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

impl FromStr for Phase {
    type Err = DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "before:request" => Ok(Phase::BeforeRequest),
            "response" => Ok(Phase::Response),
            "after:response" => Ok(Phase::AfterResponse),
            other => Err(DecodeError::UnknownEvent(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<SubscriptionId>,
    #[serde(rename = "await", default)]
    pub awaiting: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyErrorPayload {
    pub name: String,
    pub message: String,
}

impl fmt::Display for ProxyErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// Phase payload. Requests fill `method`/`url`, responses fill `status_code`;
/// either may carry headers and a body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProxyErrorPayload>,
}

impl EventData {
    pub fn request(method: &str, url: &str) -> Self {
        Self {
            method: Some(method.to_string()),
            url: Some(url.to_string()),
            ..Self::default()
        }
    }

    pub fn response(status_code: u16) -> Self {
        Self {
            status_code: Some(status_code),
            ..Self::default()
        }
    }

    pub fn failed(name: &str, message: &str) -> Self {
        Self {
            error: Some(ProxyErrorPayload {
                name: name.to_string(),
                message: message.to_string(),
            }),
            ..Self::default()
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyEvent {
    #[serde(rename = "event")]
    pub phase: Phase,
    pub event_id: EventId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    pub route_handler_id: RouteHandlerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionRef>,
    #[serde(default)]
    pub data: EventData,
}

impl ProxyEvent {
    pub fn new(phase: Phase, event_id: &str, route_handler_id: &RouteHandlerId) -> Self {
        Self {
            phase,
            event_id: EventId::from(event_id),
            request_id: None,
            route_handler_id: route_handler_id.clone(),
            subscription: None,
            data: EventData::default(),
        }
    }

    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.request_id = Some(RequestId::from(request_id));
        self
    }

    pub fn awaited(mut self) -> Self {
        self.subscription.get_or_insert_with(SubscriptionRef::default).awaiting = true;
        self
    }

    pub fn with_subscription(mut self, id: SubscriptionId) -> Self {
        self.subscription.get_or_insert_with(SubscriptionRef::default).id = Some(id);
        self
    }

    pub fn with_data(mut self, data: EventData) -> Self {
        self.data = data;
        self
    }

    /// `before:request` events may omit the request id; the event id then
    /// stands in for it.
    pub fn effective_request_id(&self) -> RequestId {
        self.request_id
            .clone()
            .unwrap_or_else(|| RequestId::from(&self.event_id))
    }

    pub fn awaiting(&self) -> bool {
        self.subscription.as_ref().is_some_and(|sub| sub.awaiting)
    }

    pub fn subscription_id(&self) -> Option<&SubscriptionId> {
        self.subscription.as_ref().and_then(|sub| sub.id.as_ref())
    }
}
