//! Inbound request routing
//!
//! Every request the transport delivers ends up in
//! [`RequestDispatcher::handle_request`]. Failures are logged and published as
//! telemetry; nothing a single request does can take the daemon down or leak
//! internal error detail to the peer.

use std::sync::Arc;

use async_trait::async_trait;
use rvoip_sip_core::{Method, Request, StatusCode};
use tracing::{debug, error};

use crate::context::{DomainResolver, NotifierContext};
use crate::error::Result;
use crate::manager::SubscriptionManager;
use crate::monitor::{MonitorEventType, MonitorRecord, MonitorSink};
use crate::notify::NotifyManager;
use crate::sip;
use crate::transport::{SipEndPoint, Transport};

/// Receives SUBSCRIBE requests
#[async_trait]
pub trait SubscribeHandler: Send + Sync {
    async fn add_subscribe_request(&self, local: SipEndPoint, remote: SipEndPoint, request: Request) -> Result<()>;
}

/// Receives NOTIFY requests addressed to a serviced account
pub trait NotificationQueue: Send + Sync {
    fn queue_notification(&self, request: Request) -> Result<()>;
}

#[async_trait]
impl SubscribeHandler for SubscriptionManager {
    async fn add_subscribe_request(&self, local: SipEndPoint, remote: SipEndPoint, request: Request) -> Result<()> {
        SubscriptionManager::add_subscribe_request(self, local, remote, request).await
    }
}

impl NotificationQueue for NotifyManager {
    fn queue_notification(&self, request: Request) -> Result<()> {
        NotifyManager::queue_notification(self, request)
    }
}

/// Routes inbound requests by method
pub struct RequestDispatcher {
    transport: Arc<dyn Transport>,
    domains: Arc<dyn DomainResolver>,
    monitor: Arc<dyn MonitorSink>,
    subscriptions: Arc<dyn SubscribeHandler>,
    notifications: Arc<dyn NotificationQueue>,
}

impl RequestDispatcher {
    pub fn new(
        context: &NotifierContext,
        transport: Arc<dyn Transport>,
        subscriptions: Arc<dyn SubscribeHandler>,
        notifications: Arc<dyn NotificationQueue>,
    ) -> Self {
        Self {
            transport,
            domains: context.domains.clone(),
            monitor: context.monitor.clone(),
            subscriptions,
            notifications,
        }
    }

    /// Handle one request. Never fails; errors are logged and reported.
    pub async fn handle_request(&self, local: SipEndPoint, remote: SipEndPoint, request: Request) {
        let method = request.method();
        let uri = request.uri.clone();

        if let Err(e) = self.route(local, remote, request).await {
            error!("Failed to handle {} request for {} from {}: {}", method, uri, remote, e);
            self.monitor.publish(MonitorRecord::notifier(
                MonitorEventType::Error,
                format!("Failed to handle {} request for {}: {}", method, uri, e),
                None,
            ));
        }
    }

    async fn route(&self, local: SipEndPoint, remote: SipEndPoint, request: Request) -> Result<()> {
        match request.method() {
            Method::Notify => self.handle_notify(remote, request).await,
            Method::Subscribe => {
                self.subscriptions
                    .add_subscribe_request(local, remote, request)
                    .await
            }
            _ => {
                self.monitor.publish(MonitorRecord::notifier(
                    MonitorEventType::UnrecognisedMessage,
                    format!("{} request from {} not supported.", request.method(), remote),
                    None,
                ));
                self.respond(&request, StatusCode::MethodNotAllowed, None).await
            }
        }
    }

    async fn handle_notify(&self, remote: SipEndPoint, request: Request) -> Result<()> {
        if sip::is_keep_alive(&request) {
            self.monitor.publish(MonitorRecord::notifier(
                MonitorEventType::NatKeepAlive,
                format!("Keep-alive NOTIFY received from {}.", remote),
                None,
            ));
            return self.respond(&request, StatusCode::Ok, None).await;
        }

        let domain = self.domains.canonical_domain(&sip::host(&request.uri), true).await?;
        if domain.is_some() && sip::user(&request.uri).is_some() {
            debug!("Queueing NOTIFY for {} from {}", request.uri, remote);
            self.notifications.queue_notification(request)
        } else {
            self.respond(&request, StatusCode::NotFound, Some("Domain not serviced")).await
        }
    }

    async fn respond(&self, request: &Request, status: StatusCode, reason: Option<&str>) -> Result<()> {
        self.transport
            .send_response(sip::response_for(request, status, reason))
            .await
    }
}
