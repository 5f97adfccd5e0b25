//! Live push over WebSockets
//!
//! A connection authenticates with an expiring signature, subscribes to
//! activity streams its authorization handler admits, and receives stream
//! updates fanned out over the pub/sub bus. Channel subscriptions are
//! idempotent per process: the first local subscriber of a channel opens the
//! bus subscription, the last one leaving closes it.

pub mod channels;
pub mod frames;
pub mod publisher;
pub mod session;

pub use channels::PushChannels;
pub use frames::{
    push_channel, AuthenticationPayload, ClientFrame, PushEnvelope, ServerFrame, StreamRef,
    SubscribePayload,
};
pub use publisher::PushPublisher;
pub use session::PushService;
