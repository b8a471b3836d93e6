//! Outbound NOTIFY handling
//!
//! - [`NotifyQueue`] sends the NOTIFYs generated by subscriptions
//! - [`NotifyManager`] relays NOTIFYs addressed to a serviced account on to
//!   that account's registered contacts

pub mod queue;
pub mod relay;

pub use queue::{NotifyQueue, OutboundNotify};
pub use relay::{NotifyManager, MAX_RELAY_BINDINGS};
