//! Subscription manager
//!
//! Owns every active [`EventSubscription`], accepts SUBSCRIBE requests and
//! fans machine events out to the subscriptions whose filter matches. NOTIFYs
//! are built here and handed to the [`NotifyQueue`] while the subscription's
//! lock is held, so deltas for one subscription reach the queue in version
//! order.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use rvoip_sip_core::types::call_id::CallId;
use rvoip_sip_core::types::contact::{Contact, ContactParamInfo};
use rvoip_sip_core::types::content_type::ContentType;
use rvoip_sip_core::types::cseq::CSeq;
use rvoip_sip_core::types::event::Event;
use rvoip_sip_core::types::expires::Expires;
use rvoip_sip_core::types::from::From as FromHeader;
use rvoip_sip_core::types::header::{HeaderName, HeaderValue};
use rvoip_sip_core::types::max_forwards::MaxForwards;
use rvoip_sip_core::types::subscription_state::SubscriptionState;
use rvoip_sip_core::types::to::To;
use rvoip_sip_core::types::uri::{Host, Scheme};
use rvoip_sip_core::types::TypedHeader;
use rvoip_sip_core::{Method, Request, Response, StatusCode, Uri};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::{AuthOutcome, NotifierContext};
use crate::error::{NotifierError, Result};
use crate::monitor::{MachineEvent, MonitorEventType, MonitorRecord};
use crate::notify::NotifyQueue;
use crate::sip;
use crate::subscription::{
    new_subscription, EventPackage, EventSubscription, SubscriptionDialogue, SubscriptionInfo,
};
use crate::transport::{SipEndPoint, Transport};

/// Packages advertised in `Allow-Events` on a 489
const ALLOWED_EVENTS: &str = "dialog";

/// Active subscriptions keyed by the SUBSCRIBE's Call-ID
pub struct SubscriptionManager {
    context: NotifierContext,
    transport: Arc<dyn Transport>,
    notify_queue: Arc<NotifyQueue>,
    subscriptions: DashMap<String, Arc<dyn EventSubscription>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl SubscriptionManager {
    pub fn new(context: NotifierContext, transport: Arc<dyn Transport>, notify_queue: Arc<NotifyQueue>) -> Self {
        Self {
            context,
            transport,
            notify_queue,
            subscriptions: DashMap::new(),
            listener: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn subscription(&self, session_id: &str) -> Option<Arc<dyn EventSubscription>> {
        self.subscriptions.get(session_id).map(|entry| entry.value().clone())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Accept, refresh or reject a SUBSCRIBE
    pub async fn add_subscribe_request(&self, local: SipEndPoint, remote: SipEndPoint, request: Request) -> Result<()> {
        if self.is_stopped() {
            return Err(NotifierError::Shutdown);
        }

        let requested = sip::event_package(&request);
        let package = match requested.as_deref().map(str::parse::<EventPackage>) {
            Some(Ok(EventPackage::Dialog)) => EventPackage::Dialog,
            _ => {
                self.publish(
                    MonitorEventType::SubscribeFailed,
                    format!(
                        "Event type {} not supported for {}.",
                        requested.as_deref().unwrap_or("none"),
                        request.uri
                    ),
                    None,
                );
                let response = sip::response_for(&request, sip::BAD_EVENT, None).with_header(TypedHeader::Other(
                    HeaderName::AllowEvents,
                    HeaderValue::text(ALLOWED_EVENTS),
                ));
                return self.transport.send_response(response).await;
            }
        };

        let domain = match sip::user(&request.uri) {
            Some(_) => {
                self.context
                    .domains
                    .canonical_domain(&sip::host(&request.uri), false)
                    .await?
            }
            None => None,
        };
        let (Some(user), Some(domain)) = (sip::user(&request.uri), domain) else {
            self.publish(
                MonitorEventType::SubscribeFailed,
                format!("Resource {} not serviced.", request.uri),
                None,
            );
            return self.respond(&request, StatusCode::NotFound, Some("Domain not serviced")).await;
        };

        let Some(account) = self.context.accounts.account(user, &domain).await? else {
            self.publish(
                MonitorEventType::SubscribeFailed,
                format!("Resource {}@{} not found.", user, domain),
                None,
            );
            return self.respond(&request, StatusCode::NotFound, None).await;
        };

        match self
            .context
            .authenticator
            .authenticate(local, remote, &request, &account)
            .await?
        {
            AuthOutcome::Authenticated => {}
            AuthOutcome::Challenge(challenge) => {
                self.publish(
                    MonitorEventType::SubscribeAuth,
                    format!("Subscription for {} challenged.", account.uri()),
                    Some(&account.owner),
                );
                return self.transport.send_response(challenge).await;
            }
            AuthOutcome::Rejected(reason) => {
                self.publish(
                    MonitorEventType::SubscribeAuth,
                    format!("Subscription for {} rejected: {}.", account.uri(), reason),
                    Some(&account.owner),
                );
                return self.respond(&request, StatusCode::Forbidden, None).await;
            }
        }

        let (Some(call_id), Some(from)) = (
            request.call_id().map(|call_id| call_id.to_string()),
            request.from().map(|from| from.0.clone()),
        ) else {
            return self
                .respond(&request, StatusCode::BadRequest, Some("Missing Call-ID or From"))
                .await;
        };
        let expiry = self.context.config.granted_expiry(sip::expires(&request));
        let canonical = sip::with_host(&request.uri, &domain);

        if let Some(existing) = self.subscription(&call_id) {
            let info = existing.info();
            let same_dialog = info.owner() == account.owner
                && sip::aor(&info.canonical_resource_uri) == sip::aor(&canonical)
                && existing.event_package() == package
                && info.dialogue.remote_tag() == from.tag();
            if !same_dialog {
                self.publish(
                    MonitorEventType::SubscribeFailed,
                    format!(
                        "Subscription refresh for {} rejected, Call-ID {} belongs to another subscription.",
                        request.uri, call_id
                    ),
                    Some(&account.owner),
                );
                return self
                    .respond(&request, StatusCode::CallOrTransactionDoesNotExist, None)
                    .await;
            }

            info.set_expiry(expiry);
            let response = self.accepted(&request, &info.dialogue.local_tag, expiry);
            self.transport.send_response(response).await?;
            self.publish(
                MonitorEventType::SubscribeRenew,
                format!(
                    "Subscription renewal for {} {}, expiry {}s.",
                    existing.event_package(),
                    info.resource_uri,
                    expiry
                ),
                Some(&account.owner),
            );
            return self.flush(&existing);
        }

        let local_tag = Uuid::new_v4().simple().to_string();
        let mut resource = request
            .to()
            .map(|to| to.0.clone())
            .unwrap_or_else(|| sip::address(request.uri.clone()));
        resource.set_tag(local_tag.clone());
        let remote_target = sip::contact_uri(&request).unwrap_or_else(|| from.uri.clone());

        let dialogue = SubscriptionDialogue::new(
            call_id.clone(),
            local_tag.clone(),
            resource,
            from,
            remote_target,
            local,
            remote,
            account.owner.clone(),
        );
        let filter = std::str::from_utf8(request.body())
            .ok()
            .map(str::trim)
            .filter(|body| !body.is_empty())
            .map(str::to_string);
        let info = SubscriptionInfo::new(
            call_id.clone(),
            request.uri.clone(),
            canonical,
            filter,
            Arc::new(dialogue),
            expiry,
        );
        let subscription = new_subscription(package, info, &self.context)?;

        self.transport
            .send_response(self.accepted(&request, &local_tag, expiry))
            .await?;

        // In the table before the snapshot is read, so events raised while the
        // store is queried are held by the subscription and merged into it
        self.subscriptions.insert(call_id.clone(), subscription.clone());

        self.publish(
            MonitorEventType::SubscribeAccept,
            format!(
                "Subscription accepted for {} {}, expiry {}s, filter {}.",
                package,
                subscription.info().resource_uri,
                expiry,
                subscription.monitor_filter()
            ),
            Some(&account.owner),
        );

        // The subscriber still gets a (possibly empty) full-state NOTIFY
        if let Err(e) = subscription.get_full_state().await {
            warn!("Failed to load full state for subscription {}: {}", call_id, e);
        }
        self.flush(&subscription)
    }

    /// Apply a machine event to every matching subscription. Returns the
    /// number of NOTIFYs queued.
    pub async fn fire_machine_event(&self, event: &MachineEvent) -> usize {
        if self.is_stopped() {
            return 0;
        }

        let matching: Vec<Arc<dyn EventSubscription>> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.value().monitor_filter().matches(event))
            .map(|entry| entry.value().clone())
            .collect();

        if matching.is_empty() {
            debug!("No subscriptions for {} on {}", event.kind, event.resource_uri);
            return 0;
        }

        let deliveries = matching.iter().map(|subscription| self.deliver(subscription, event));
        join_all(deliveries).await.into_iter().filter(|sent| *sent).count()
    }

    async fn deliver(&self, subscription: &Arc<dyn EventSubscription>, event: &MachineEvent) -> bool {
        let session_id = &subscription.info().session_id;
        match subscription.add_monitor_event(event).await {
            Ok(true) => match self.flush(subscription) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to queue NOTIFY for subscription {}: {}", session_id, e);
                    false
                }
            },
            Ok(false) => false,
            Err(e @ NotifierError::SubscriptionInvariant { .. }) => {
                error!("Subscription {} rejected {} event: {}", session_id, event.kind, e);
                false
            }
            Err(e) => {
                warn!("Subscription {} failed to apply {} event: {}", session_id, event.kind, e);
                false
            }
        }
    }

    /// Consume machine events until the channel closes or the manager stops
    pub fn spawn_event_listener(self: &Arc<Self>, mut events: mpsc::Receiver<MachineEvent>) {
        let manager = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(manager) = manager.upgrade() else { break };
                manager.fire_machine_event(&event).await;
            }
            debug!("Machine event listener exited");
        });

        if let Some(previous) = self.listener.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the listener and drop every subscription. Safe to call twice.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        let count = self.subscriptions.len();
        self.subscriptions.clear();
        info!("Subscription manager stopped, {} subscriptions dropped", count);
    }

    /// Serialize pending content into a NOTIFY and queue it
    fn flush(&self, subscription: &Arc<dyn EventSubscription>) -> Result<()> {
        let info = subscription.info();
        let dialogue = info.dialogue.clone();
        let destination = self
            .context
            .config
            .outbound_proxy
            .unwrap_or(dialogue.remote_end_point);
        let package = subscription.event_package();
        let content_type = subscription.notify_content_type();
        let expiry = info.expiry();
        let queue = self.notify_queue.clone();

        subscription.flush(&mut |body: String| {
            let request = build_notify(&dialogue, package, content_type, expiry, body)?;
            queue.enqueue(destination, request)
        })
    }

    async fn respond(&self, request: &Request, status: StatusCode, reason: Option<&str>) -> Result<()> {
        self.transport
            .send_response(sip::response_for(request, status, reason))
            .await
    }

    /// 200 OK for a SUBSCRIBE, with our tag on the To header
    fn accepted(&self, request: &Request, local_tag: &str, expiry: u32) -> Response {
        let mut response = sip::response_for(request, StatusCode::Ok, None);
        sip::set_to_tag(&mut response, local_tag);
        response.with_header(TypedHeader::Expires(Expires(expiry)))
    }

    fn publish(&self, event_type: MonitorEventType, message: String, owner: Option<&str>) {
        self.context.publish(MonitorRecord::notifier(event_type, message, owner));
    }
}

fn header_error(e: impl std::fmt::Display) -> NotifierError {
    NotifierError::notify_body(format!("Invalid NOTIFY header: {}", e))
}

/// Build an in-dialog NOTIFY carrying `body`
fn build_notify(
    dialogue: &SubscriptionDialogue,
    package: EventPackage,
    content_type: &str,
    expiry: u32,
    body: String,
) -> Result<Request> {
    let state = if expiry == 0 {
        "terminated;reason=timeout".to_string()
    } else {
        format!("active;expires={}", expiry)
    };
    let event = Event::from_str(package.as_str()).map_err(header_error)?;
    let state = SubscriptionState::from_str(&state).map_err(header_error)?;
    let content_type = ContentType::from_str(content_type).map_err(header_error)?;

    let local = dialogue.local_end_point.address;
    let contact = sip::address(Uri::new(Scheme::Sip, Host::from(local.ip())).with_port(local.port()));
    let cseq = dialogue.next_cseq();

    Ok(Request::new(Method::Notify, dialogue.remote_target.clone())
        .with_header(TypedHeader::MaxForwards(MaxForwards::new(70)))
        .with_header(TypedHeader::From(FromHeader(dialogue.local.clone())))
        .with_header(TypedHeader::To(To(dialogue.remote.clone())))
        .with_header(TypedHeader::CallId(CallId::new(dialogue.call_id.clone())))
        .with_header(TypedHeader::CSeq(CSeq::new(cseq, Method::Notify)))
        .with_header(TypedHeader::Contact(Contact::new_params(vec![ContactParamInfo { address: contact }])))
        .with_header(TypedHeader::Event(event))
        .with_header(TypedHeader::SubscriptionState(state))
        .with_header(TypedHeader::ContentType(content_type))
        .with_body(body))
}
