//! Collaborators consumed by the notifier and the context value wiring them
//!
//! Every external dependency (domain resolution, dialogue and binding
//! persistence, accounts, authentication, telemetry) is a trait object held by
//! [`NotifierContext`]. The context is built once at startup and cloned into
//! each component, so each collaborator can be replaced independently in tests.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use rvoip_sip_core::{Request, Response, Uri};
use uuid::Uuid;

use crate::config::NotifierConfig;
use crate::error::Result;
use crate::monitor::{MonitorRecord, MonitorSink, TracingMonitorSink};
use crate::transport::SipEndPoint;

/// Which side created a dialogue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DialogueDirection {
    /// The owner received the call
    Recipient,
    /// The owner placed the call
    Initiator,
}

/// A call leg owned by an account, read from persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dialogue {
    pub id: Uuid,
    pub owner: String,
    /// Set when this leg is one side of a two-party bridge
    pub bridge_id: Option<Uuid>,
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
    pub local_uri: Option<Uri>,
    pub remote_uri: Option<Uri>,
    pub direction: DialogueDirection,
    pub cseq: u32,
    pub created: DateTime<Utc>,
}

impl Dialogue {
    pub fn new(owner: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            bridge_id: None,
            call_id: call_id.into(),
            local_tag: Uuid::new_v4().simple().to_string(),
            remote_tag: Uuid::new_v4().simple().to_string(),
            local_uri: None,
            remote_uri: None,
            direction: DialogueDirection::Recipient,
            cseq: 1,
            created: Utc::now(),
        }
    }

    pub fn with_bridge(mut self, bridge_id: Uuid) -> Self {
        self.bridge_id = Some(bridge_id);
        self
    }

    pub fn with_remote_uri(mut self, uri: Uri) -> Self {
        self.remote_uri = Some(uri);
        self
    }

    pub fn with_direction(mut self, direction: DialogueDirection) -> Self {
        self.direction = direction;
        self
    }
}

/// A SIP account serviced by this platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SipAccount {
    pub id: Uuid,
    pub owner: String,
    pub username: String,
    pub domain: String,
}

impl SipAccount {
    pub fn new(owner: impl Into<String>, username: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            username: username.into(),
            domain: domain.into(),
        }
    }

    pub fn uri(&self) -> Uri {
        Uri::sip(self.domain.clone()).with_user(self.username.clone())
    }
}

/// A registrar binding: one contact currently registered for an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrarBinding {
    pub id: Uuid,
    pub account_id: Uuid,
    pub contact_uri: Uri,
    /// Where the REGISTER came from, used as the NAT-friendly destination
    pub remote_end_point: Option<SipEndPoint>,
    pub expiry: u32,
}

/// Result of authenticating an inbound request
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    Authenticated,
    /// Send this challenge (401/407) back and stop processing
    Challenge(Response),
    Rejected(String),
}

/// Resolves request hosts to the canonical domain they are serviced under
#[async_trait]
pub trait DomainResolver: Send + Sync {
    async fn canonical_domain(&self, host: &str, allow_wildcard: bool) -> Result<Option<String>>;
}

/// Read access to persisted dialogues
#[async_trait]
pub trait DialogueStore: Send + Sync {
    /// Dialogues for an owner in a stable order, windowed by offset/limit
    async fn dialogues_for_owner(&self, owner: &str, offset: usize, limit: usize) -> Result<Vec<Dialogue>>;

    async fn dialogue(&self, id: Uuid) -> Result<Option<Dialogue>>;

    /// The other leg sharing `bridge_id`, excluding `local_id`
    async fn remote_dialogue_for_bridge(&self, bridge_id: Uuid, local_id: Uuid) -> Result<Option<Dialogue>>;
}

/// Read access to registrar bindings
#[async_trait]
pub trait BindingStore: Send + Sync {
    async fn bindings(&self, account_id: Uuid, offset: usize, limit: usize) -> Result<Vec<RegistrarBinding>>;

    async fn binding_count(&self, account_id: Uuid) -> Result<usize>;
}

/// Account persistence accessor
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn account(&self, username: &str, domain: &str) -> Result<Option<SipAccount>>;
}

/// Authenticates requests against an account's credentials
#[async_trait]
pub trait RequestAuthenticator: Send + Sync {
    async fn authenticate(
        &self,
        local: SipEndPoint,
        remote: SipEndPoint,
        request: &Request,
        account: &SipAccount,
    ) -> Result<AuthOutcome>;
}

/// Authenticator that accepts every request, for trusted deployments behind a proxy
#[derive(Debug, Default, Clone)]
pub struct TrustedAuthenticator;

#[async_trait]
impl RequestAuthenticator for TrustedAuthenticator {
    async fn authenticate(
        &self,
        _local: SipEndPoint,
        _remote: SipEndPoint,
        _request: &Request,
        _account: &SipAccount,
    ) -> Result<AuthOutcome> {
        Ok(AuthOutcome::Authenticated)
    }
}

/// Dependency value shared by every notifier component
#[derive(Clone)]
pub struct NotifierContext {
    pub config: Arc<NotifierConfig>,
    pub domains: Arc<dyn DomainResolver>,
    pub dialogues: Arc<dyn DialogueStore>,
    pub bindings: Arc<dyn BindingStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub authenticator: Arc<dyn RequestAuthenticator>,
    pub monitor: Arc<dyn MonitorSink>,
}

impl std::fmt::Debug for NotifierContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifierContext")
            .field("config", &self.config)
            .field("domains", &"Arc<dyn DomainResolver>")
            .field("dialogues", &"Arc<dyn DialogueStore>")
            .field("bindings", &"Arc<dyn BindingStore>")
            .field("accounts", &"Arc<dyn AccountStore>")
            .field("authenticator", &"Arc<dyn RequestAuthenticator>")
            .field("monitor", &"Arc<dyn MonitorSink>")
            .finish()
    }
}

impl NotifierContext {
    /// Create a context that trusts every request and logs telemetry via `tracing`
    pub fn new(
        config: NotifierConfig,
        domains: Arc<dyn DomainResolver>,
        dialogues: Arc<dyn DialogueStore>,
        bindings: Arc<dyn BindingStore>,
        accounts: Arc<dyn AccountStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            domains,
            dialogues,
            bindings,
            accounts,
            authenticator: Arc::new(TrustedAuthenticator),
            monitor: Arc::new(TracingMonitorSink),
        }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn RequestAuthenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn MonitorSink>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn publish(&self, record: MonitorRecord) {
        self.monitor.publish(record);
    }
}
