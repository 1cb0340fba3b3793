//! `teleop-middleware` – the message channel.
//!
//! Carries pose, command, state and camera data between the pose source, the
//! operators, the robot sinks and the recorder without caring about the
//! data's meaning.
//!
//! # Modules
//!
//! - [`bus`] – typed topic publish/subscribe with last-value-wins delivery
//!   and bounded queued subscriptions, plus the endpoint directory.
//! - [`rpc`] – named request/reply endpoints with bounded timeouts.
//! - [`topics`] – canonical topic and endpoint names.
//! - [`bridge`] – WebSocket bridge streaming topics as JSON to external
//!   diagnostics clients.
//! - [`error`] – [`ChannelError`].

pub mod bridge;
pub mod bus;
pub mod error;
pub mod rpc;
pub mod topics;

pub use bridge::DiagnosticsBridge;
pub use bus::{
    Envelope, MergedSubscription, MessageBus, QueuedSubscription, Subscription, Topic, TopicInfo,
};
pub use error::ChannelError;
pub use rpc::{Endpoint, Request, ServiceHandle};
