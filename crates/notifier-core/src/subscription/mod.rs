//! Event subscriptions (RFC 6665)
//!
//! Each accepted SUBSCRIBE becomes one [`EventSubscription`] owned by the
//! [`SubscriptionManager`](crate::manager::SubscriptionManager). Packages are a
//! closed set ([`EventPackage`]); adding a package means adding a variant and an
//! implementation of the trait, not widening the trait.
//!
//! The lifecycle of a subscription's payload is:
//!
//! ```text
//! get_full_state ─▶ flush (state=full, version 0)
//!        ▲                       │
//!        │                       ▼
//!  add_monitor_event ──▶ flush (state=partial, version n+1) ──▶ ...
//! ```

pub mod dialog;
pub mod dialog_info;

pub use dialog::DialogEventSubscription;
pub use dialog_info::{
    DialogDeltaItem, DialogEventAggregate, DialogInfoDocument, DialogInfoState, DialogItemState,
};

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rvoip_sip_core::types::address::Address;
use rvoip_sip_core::Uri;
use serde::{Deserialize, Serialize};

use crate::context::NotifierContext;
use crate::error::{NotifierError, Result};
use crate::monitor::MachineEvent;
use crate::sip;
use crate::transport::SipEndPoint;

/// MIME type of RFC 4235 dialog-info bodies
pub const DIALOG_INFO_CONTENT_TYPE: &str = "application/dialog-info+xml";

/// MIME type of RFC 3863 PIDF bodies
pub const PIDF_CONTENT_TYPE: &str = "application/pidf+xml";

/// Event packages known to the notifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventPackage {
    Dialog,
    /// Recognised so that registrar events can be routed, but not served
    Presence,
}

impl EventPackage {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventPackage::Dialog => "dialog",
            EventPackage::Presence => "presence",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            EventPackage::Dialog => DIALOG_INFO_CONTENT_TYPE,
            EventPackage::Presence => PIDF_CONTENT_TYPE,
        }
    }
}

impl fmt::Display for EventPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventPackage {
    type Err = NotifierError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dialog" => Ok(EventPackage::Dialog),
            "presence" => Ok(EventPackage::Presence),
            other => Err(NotifierError::request(format!("Unknown event package: {}", other))),
        }
    }
}

/// Predicate selecting the machine events a subscription wants
///
/// Renders as `"<package> <resource>"`; matches on package and resource
/// address-of-record equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MonitorFilter {
    pub package: EventPackage,
    pub resource: String,
}

impl MonitorFilter {
    pub fn new(package: EventPackage, resource: &Uri) -> Self {
        Self {
            package,
            resource: sip::aor(resource),
        }
    }

    pub fn matches(&self, event: &MachineEvent) -> bool {
        event.kind.package() == self.package && sip::aor(&event.resource_uri) == self.resource
    }
}

impl fmt::Display for MonitorFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.package, self.resource)
    }
}

/// The SIP dialog a subscription's NOTIFYs are sent within
#[derive(Debug)]
pub struct SubscriptionDialogue {
    pub call_id: String,
    /// Our tag, returned in the To header of the 200 OK
    pub local_tag: String,
    /// Resource identity, used as the From of NOTIFYs
    pub local: Address,
    /// Subscriber identity, used as the To of NOTIFYs
    pub remote: Address,
    /// Request-URI for NOTIFYs (the subscriber's Contact)
    pub remote_target: Uri,
    /// Where the SUBSCRIBE came from
    pub remote_end_point: SipEndPoint,
    pub local_end_point: SipEndPoint,
    /// Account owner of the watched resource
    pub owner: String,
    cseq: AtomicU32,
}

impl SubscriptionDialogue {
    pub fn new(
        call_id: impl Into<String>,
        local_tag: impl Into<String>,
        local: Address,
        remote: Address,
        remote_target: Uri,
        local_end_point: SipEndPoint,
        remote_end_point: SipEndPoint,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            local,
            remote,
            remote_target,
            remote_end_point,
            local_end_point,
            owner: owner.into(),
            cseq: AtomicU32::new(0),
        }
    }

    /// CSeq of the most recent NOTIFY
    pub fn cseq(&self) -> u32 {
        self.cseq.load(Ordering::SeqCst)
    }

    /// Tag the subscriber put on its From header
    pub fn remote_tag(&self) -> Option<&str> {
        self.remote.tag()
    }

    /// Allocate the CSeq for the next NOTIFY
    pub fn next_cseq(&self) -> u32 {
        self.cseq.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Attributes every subscription carries regardless of package
#[derive(Debug)]
pub struct SubscriptionInfo {
    pub session_id: String,
    pub resource_uri: Uri,
    pub canonical_resource_uri: Uri,
    pub filter: Option<String>,
    pub dialogue: Arc<SubscriptionDialogue>,
    expiry: AtomicU32,
}

impl SubscriptionInfo {
    pub fn new(
        session_id: impl Into<String>,
        resource_uri: Uri,
        canonical_resource_uri: Uri,
        filter: Option<String>,
        dialogue: Arc<SubscriptionDialogue>,
        expiry: u32,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            resource_uri,
            canonical_resource_uri,
            filter,
            dialogue,
            expiry: AtomicU32::new(expiry),
        }
    }

    pub fn expiry(&self) -> u32 {
        self.expiry.load(Ordering::SeqCst)
    }

    pub fn set_expiry(&self, expiry: u32) {
        self.expiry.store(expiry, Ordering::SeqCst);
    }

    pub fn owner(&self) -> &str {
        &self.dialogue.owner
    }
}

/// Package-specific behaviour of one active subscription
///
/// `add_monitor_event`, `notify_body`, `notification_sent` and `flush` are
/// serialized by one lock per subscription; unrelated subscriptions never
/// contend.
#[async_trait]
pub trait EventSubscription: Send + Sync {
    fn info(&self) -> &SubscriptionInfo;

    fn event_package(&self) -> EventPackage;

    fn monitor_filter(&self) -> MonitorFilter {
        MonitorFilter::new(self.event_package(), &self.info().canonical_resource_uri)
    }

    fn notify_content_type(&self) -> &'static str {
        self.event_package().content_type()
    }

    /// Replace pending content with a complete snapshot and mark it full
    async fn get_full_state(&self) -> Result<()>;

    /// Serialize the current payload without changing it
    fn notify_body(&self) -> Result<String>;

    /// Apply one machine event; `true` means a NOTIFY should follow
    async fn add_monitor_event(&self, event: &MachineEvent) -> Result<bool>;

    /// Record that the last serialized payload went out
    fn notification_sent(&self);

    /// Serialize, hand the body to `dispatch`, then run `notification_sent`,
    /// all under one acquisition of the subscription lock. When `dispatch`
    /// fails the pending content and version are left untouched.
    fn flush(&self, dispatch: &mut (dyn FnMut(String) -> Result<()> + Send)) -> Result<()>;
}

/// Build the subscription variant for `package`
pub fn new_subscription(
    package: EventPackage,
    info: SubscriptionInfo,
    context: &NotifierContext,
) -> Result<Arc<dyn EventSubscription>> {
    match package {
        EventPackage::Dialog => Ok(Arc::new(DialogEventSubscription::new(
            info,
            context.dialogues.clone(),
            context.monitor.clone(),
            context.config.max_dialogues_for_notify,
        ))),
        EventPackage::Presence => Err(NotifierError::request(
            "The presence event package is not served by this notifier",
        )),
    }
}
