mod codec;
mod error;
mod event;
mod ids;
mod reply;

pub use codec::{decode_event, decode_event_line, encode_reply};
pub use error::DecodeError;
pub use event::{EventData, Phase, ProxyErrorPayload, ProxyEvent, SubscriptionRef};
pub use ids::{EventId, RequestId, RouteHandlerId, SubscriptionId};
pub use reply::{ProxyReply, ReplyOutcome, StaticResponse, SubscriptionGrant};
