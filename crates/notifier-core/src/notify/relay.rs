//! Relay for NOTIFY requests addressed to a serviced account
//!
//! Some platforms (voicemail servers, feature servers) send NOTIFYs to a
//! user's address-of-record rather than to a registered contact. The relay
//! looks up the account's registrar bindings and forwards a copy to each one.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rvoip_sip_core::types::header::HeaderName;
use rvoip_sip_core::types::max_forwards::MaxForwards;
use rvoip_sip_core::types::uri::Host;
use rvoip_sip_core::types::TypedHeader;
use rvoip_sip_core::{Request, StatusCode};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::{NotifierContext, RegistrarBinding};
use crate::error::{NotifierError, Result};
use crate::monitor::{MonitorEventType, MonitorRecord};
use crate::sip;
use crate::transport::{SipEndPoint, Transport};

/// Upper bound on the bindings a single NOTIFY is copied to
pub const MAX_RELAY_BINDINGS: usize = 10;

const DEFAULT_SIP_PORT: u16 = 5060;

/// Max-Forwards assumed when the inbound NOTIFY carries none
const DEFAULT_MAX_FORWARDS: u8 = 70;

/// Queues addressed NOTIFYs and forwards them to the account's bindings
pub struct NotifyManager {
    context: NotifierContext,
    tx: Mutex<Option<mpsc::Sender<Request>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NotifyManager {
    /// Create the relay and spawn its worker
    pub fn start(context: NotifierContext, transport: Arc<dyn Transport>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<Request>(context.config.relay_queue_capacity.max(1));

        let worker_context = context.clone();
        let worker = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let call_id = request
                    .call_id()
                    .map(|call_id| call_id.to_string())
                    .unwrap_or_else(|| "-".to_string());
                if let Err(e) = relay(&worker_context, transport.as_ref(), request).await {
                    warn!("Failed to relay NOTIFY {}: {}", call_id, e);
                    worker_context.publish(MonitorRecord::notifier(
                        MonitorEventType::Error,
                        format!("NOTIFY relay failed for {}: {}", call_id, e),
                        None,
                    ));
                }
            }
            debug!("Notify relay worker exited");
        });

        Arc::new(Self {
            context,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Hand a NOTIFY to the relay worker without waiting for it to be processed
    pub fn queue_notification(&self, request: Request) -> Result<()> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(NotifierError::Shutdown)?;
        tx.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NotifierError::request(format!(
                "Notify relay queue is full ({} pending)",
                self.context.config.relay_queue_capacity
            )),
            mpsc::error::TrySendError::Closed(_) => NotifierError::Shutdown,
        })
    }

    /// Close intake and let the worker finish what is already queued
    pub async fn stop(&self) -> Result<()> {
        self.tx.lock().take();

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker
                .await
                .map_err(|e| NotifierError::transport(format!("Notify relay worker failed: {}", e)))?;
            info!("Notify relay stopped");
        }
        Ok(())
    }
}

async fn respond(transport: &dyn Transport, request: &Request, status: StatusCode, reason: Option<&str>) -> Result<()> {
    transport
        .send_response(sip::response_for(request, status, reason))
        .await
}

async fn relay(context: &NotifierContext, transport: &dyn Transport, request: Request) -> Result<()> {
    if sip::max_forwards(&request) == Some(0) {
        context.publish(MonitorRecord::notifier(
            MonitorEventType::NotifierRelay,
            format!("NOTIFY for {} not relayed, Max-Forwards exhausted.", request.uri),
            None,
        ));
        return respond(transport, &request, StatusCode::TooManyHops, None).await;
    }

    let Some(user) = sip::user(&request.uri).map(str::to_string) else {
        return respond(transport, &request, StatusCode::NotFound, Some("Domain not serviced")).await;
    };
    let Some(domain) = context
        .domains
        .canonical_domain(&sip::host(&request.uri), true)
        .await?
    else {
        return respond(transport, &request, StatusCode::NotFound, Some("Domain not serviced")).await;
    };

    let Some(account) = context.accounts.account(&user, &domain).await? else {
        context.publish(MonitorRecord::notifier(
            MonitorEventType::NotifierRelay,
            format!("NOTIFY for {}@{} rejected, no such account.", user, domain),
            None,
        ));
        return respond(transport, &request, StatusCode::NotFound, Some("Not found")).await;
    };

    let bindings = context.bindings.bindings(account.id, 0, MAX_RELAY_BINDINGS).await?;
    if bindings.is_empty() {
        context.publish(MonitorRecord::notifier(
            MonitorEventType::NotifierRelay,
            format!("NOTIFY for {} not relayed, no current bindings.", account.uri()),
            Some(&account.owner),
        ));
        return respond(transport, &request, StatusCode::TemporarilyUnavailable, None).await;
    }

    let mut forwarded = 0usize;
    for binding in &bindings {
        let Some(destination) = destination_for(context.config.outbound_proxy, binding) else {
            warn!("No reachable destination for binding {} ({})", binding.id, binding.contact_uri);
            continue;
        };

        let copy = forwarded_copy(&request, binding);
        match transport.send_request(destination, copy).await {
            Ok(()) => {
                forwarded += 1;
                context.publish(MonitorRecord::notifier(
                    MonitorEventType::NotifierRelay,
                    format!(
                        "NOTIFY for {} forwarded to {} via {}.",
                        account.uri(),
                        binding.contact_uri,
                        destination
                    ),
                    Some(&account.owner),
                ));
            }
            Err(e) => warn!("Forwarding NOTIFY to {} failed: {}", destination, e),
        }
    }

    debug!("Relayed NOTIFY for {} to {} of {} bindings", account.uri(), forwarded, bindings.len());
    if forwarded == 0 {
        context.publish(MonitorRecord::notifier(
            MonitorEventType::NotifierRelay,
            format!(
                "NOTIFY for {} not relayed, none of {} bindings reachable.",
                account.uri(),
                bindings.len()
            ),
            Some(&account.owner),
        ));
        return respond(transport, &request, StatusCode::TemporarilyUnavailable, None).await;
    }
    respond(transport, &request, StatusCode::Ok, None).await
}

/// Copy of `request` retargeted at the binding's contact
fn forwarded_copy(request: &Request, binding: &RegistrarBinding) -> Request {
    let hops = sip::max_forwards(request)
        .unwrap_or(DEFAULT_MAX_FORWARDS)
        .saturating_sub(1);

    let mut copy = request.clone();
    copy.uri = binding.contact_uri.clone();
    copy.headers.retain(|header| header.name() != HeaderName::MaxForwards);
    copy.headers.push(TypedHeader::MaxForwards(MaxForwards::new(hops)));
    copy
}

/// Outbound proxy first, then where the REGISTER came from, then the
/// contact itself when its host is a literal address
fn destination_for(outbound_proxy: Option<SipEndPoint>, binding: &RegistrarBinding) -> Option<SipEndPoint> {
    if let Some(proxy) = outbound_proxy {
        return Some(proxy);
    }
    if let Some(remote) = binding.remote_end_point {
        return Some(remote);
    }

    let Host::Address(ip) = &binding.contact_uri.host else {
        return None;
    };
    let port = binding.contact_uri.port.unwrap_or(DEFAULT_SIP_PORT);
    Some(SipEndPoint::udp(SocketAddr::new(*ip, port)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvoip_sip_core::builder::SimpleRequestBuilder;
    use rvoip_sip_core::Method;
    use uuid::Uuid;

    fn binding(contact: &str, remote: Option<&str>) -> RegistrarBinding {
        RegistrarBinding {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            contact_uri: contact.parse().unwrap(),
            remote_end_point: remote.map(|r| SipEndPoint::udp(r.parse().unwrap())),
            expiry: 3600,
        }
    }

    #[test]
    fn test_destination_preference() {
        let proxy = SipEndPoint::udp("10.0.0.5:5060".parse().unwrap());
        let natted = binding("sip:alice@192.168.1.20:5062", Some("203.0.113.7:40000"));

        assert_eq!(destination_for(Some(proxy), &natted), Some(proxy));
        assert_eq!(
            destination_for(None, &natted).map(|d| d.address),
            Some("203.0.113.7:40000".parse().unwrap())
        );

        let direct = binding("sip:alice@192.168.1.20", None);
        assert_eq!(
            destination_for(None, &direct).map(|d| d.address),
            Some("192.168.1.20:5060".parse().unwrap())
        );

        let named = binding("sip:alice@phone.example.com", None);
        assert_eq!(destination_for(None, &named), None);
    }

    #[test]
    fn test_forwarded_copy_retargets_and_decrements() {
        let request = SimpleRequestBuilder::new(Method::Notify, "sip:alice@example.com")
            .unwrap()
            .max_forwards(70)
            .event("message-summary")
            .build();
        let copy = forwarded_copy(&request, &binding("sip:alice@192.168.1.20:5062", None));

        assert_eq!(copy.uri.to_string(), "sip:alice@192.168.1.20:5062");
        assert_eq!(sip::max_forwards(&copy), Some(69));
        assert_eq!(sip::event_package(&copy).as_deref(), Some("message-summary"));
        assert_eq!(
            copy.headers.iter().filter(|h| h.name() == HeaderName::MaxForwards).count(),
            1
        );
    }
}
