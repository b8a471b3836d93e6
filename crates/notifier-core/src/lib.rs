//! # Notifier-Core
//!
//! SIP SUBSCRIBE/NOTIFY notifier for RVoIP.
//!
//! This crate provides:
//! - A daemon that accepts dialog event subscriptions (RFC 6665 / RFC 4235)
//! - Full and partial `application/dialog-info+xml` NOTIFY generation with
//!   per-subscription version ordering
//! - Fan-out of dialogue machine events to matching subscriptions
//! - A relay forwarding NOTIFYs addressed to an account to its registered contacts
//! - NAT keep-alive NOTIFY handling
//!
//! ## Architecture
//!
//! ```text
//! Transport ──▶ RequestDispatcher ──┬─▶ SubscriptionManager ──▶ EventSubscription
//!                                   │            │                     │
//!                                   │            └──── flush ──────────┘
//!                                   │                    │
//!                                   └─▶ NotifyManager    ▼
//!                                             │       NotifyQueue ──▶ Transport
//!                                             └────────────────────▶ Transport
//! ```
//!
//! Socket I/O, persistence, domain resolution and authentication are
//! collaborators injected through [`NotifierContext`].

pub mod config;
pub mod context;
pub mod daemon;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod manager;
pub mod monitor;
pub mod notify;
pub mod sip;
pub mod subscription;
pub mod transport;

pub use config::NotifierConfig;
pub use context::{
    AccountStore, AuthOutcome, BindingStore, Dialogue, DialogueDirection, DialogueStore, DomainResolver,
    NotifierContext, RegistrarBinding, RequestAuthenticator, SipAccount, TrustedAuthenticator,
};
pub use daemon::NotifierDaemon;
pub use dispatcher::{NotificationQueue, RequestDispatcher, SubscribeHandler};
pub use error::{NotifierError, Result};
pub use logging::{setup_logging, LoggingConfig};
pub use manager::SubscriptionManager;
pub use monitor::{MachineEvent, MachineEventKind, MonitorEventType, MonitorRecord, MonitorSink};
pub use notify::{NotifyManager, NotifyQueue};
pub use subscription::{DialogEventSubscription, EventPackage, EventSubscription, MonitorFilter};
pub use transport::{SipEndPoint, SipProtocol, Transport, TransportEvent};

/// Common imports for embedding the notifier
pub mod prelude {
    pub use crate::config::NotifierConfig;
    pub use crate::context::*;
    pub use crate::daemon::NotifierDaemon;
    pub use crate::error::{NotifierError, Result};
    pub use crate::monitor::*;
    pub use rvoip_sip_core::{Method, Request, Response, StatusCode, Uri};
    pub use crate::subscription::{EventPackage, EventSubscription};
    pub use crate::transport::*;
}
