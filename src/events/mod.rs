//! Change notification: subscriptions, channel listening, and session fan-out
//!
//! This module provides:
//! - `subscriptions`: the `$subscription` table and subscribe/unsubscribe
//! - `listener`: long-lived listening on a node channel
//! - `EventBus`: broadcast channel distributing session events to WebSocket clients

mod bus;
pub mod listener;
pub mod subscriptions;
mod types;

pub use bus::EventBus;
pub use listener::{listen, NotificationHandler};
pub use subscriptions::{subscribe, unsubscribe, UnsubscribeBy};
pub use types::{
    ChangeAction, EventEmitter, Notification, SessionEvent, SubscriptionRef, SubscriptionRequest,
};
