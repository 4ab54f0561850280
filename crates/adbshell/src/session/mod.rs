//! Device session module.
//!
//! This module owns the connection lifecycle: connect with rollback, orderly
//! disconnect, unplug detection and shell output fan-out.

pub mod error;
pub mod manager;
pub mod output;
mod unplug;

pub use error::{SessionError, SessionResult};
pub use manager::{Collaborators, ConnectionState, SessionEvent, SessionManager, SessionOptions};
pub use output::{OutputCallback, SubscriberRegistry, Subscription, SubscriptionToken};
