//! Shared test doubles for notifier-core integration tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rvoip_sip_core::builder::SimpleRequestBuilder;
use rvoip_sip_core::types::address::Address;
use rvoip_sip_core::types::contact::{Contact, ContactParamInfo};
use rvoip_sip_core::types::header::HeaderName;
use rvoip_sip_core::types::TypedHeader;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use rvoip_notifier_core::prelude::*;
use rvoip_notifier_core::sip;
use rvoip_notifier_core::subscription::{SubscriptionDialogue, SubscriptionInfo};
use rvoip_notifier_core::DialogEventSubscription;

pub const DOMAIN: &str = "example.com";

pub fn local_end_point() -> SipEndPoint {
    SipEndPoint::udp("10.0.0.1:5060".parse().unwrap())
}

pub fn remote_end_point() -> SipEndPoint {
    SipEndPoint::udp("10.0.0.9:5070".parse().unwrap())
}

/// Transport that records everything sent and lets tests inject inbound events
#[derive(Default)]
pub struct RecordingTransport {
    pub responses: Mutex<Vec<Response>>,
    pub requests: Mutex<Vec<(SipEndPoint, Request)>>,
    pub started_on: Mutex<Vec<SipEndPoint>>,
    pub shutdowns: AtomicUsize,
    /// Make `start` fail, as a socket bind error would
    pub fail_start: AtomicBool,
    inbound: Mutex<Option<mpsc::Sender<TransportEvent>>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver a request as if it arrived from `remote_end_point()`
    pub async fn inject(&self, request: Request) {
        let tx = self.inbound.lock().clone().expect("transport not started");
        tx.send(TransportEvent::RequestReceived {
            local: local_end_point(),
            remote: remote_end_point(),
            request,
        })
        .await
        .expect("receive loop gone");
    }

    pub fn responses(&self) -> Vec<Response> {
        self.responses.lock().clone()
    }

    pub fn statuses(&self) -> Vec<u16> {
        self.responses.lock().iter().map(|r| r.status().as_u16()).collect()
    }

    pub fn requests(&self) -> Vec<(SipEndPoint, Request)> {
        self.requests.lock().clone()
    }

    pub fn notifies(&self) -> Vec<Request> {
        self.requests
            .lock()
            .iter()
            .filter(|(_, r)| r.method() == Method::Notify)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn start(&self, channels: &[SipEndPoint]) -> Result<mpsc::Receiver<TransportEvent>> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(NotifierError::transport("address already in use"));
        }
        let (tx, rx) = mpsc::channel(64);
        *self.inbound.lock() = Some(tx);
        self.started_on.lock().extend_from_slice(channels);
        Ok(rx)
    }

    async fn send_response(&self, response: Response) -> Result<()> {
        self.responses.lock().push(response);
        Ok(())
    }

    async fn send_request(&self, destination: SipEndPoint, request: Request) -> Result<()> {
        self.requests.lock().push((destination, request));
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self.inbound.lock().take() {
            let _ = tx.try_send(TransportEvent::Closed);
        }
        Ok(())
    }
}

/// Resolves a fixed set of domains and counts lookups
#[derive(Default)]
pub struct MemoryDomains {
    pub domains: HashSet<String>,
    pub lookups: AtomicUsize,
}

impl MemoryDomains {
    pub fn serving(domains: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            domains: domains.iter().map(|d| d.to_string()).collect(),
            lookups: AtomicUsize::new(0),
        })
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DomainResolver for MemoryDomains {
    async fn canonical_domain(&self, host: &str, _allow_wildcard: bool) -> Result<Option<String>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let host = host.to_ascii_lowercase();
        Ok(self.domains.contains(&host).then_some(host))
    }
}

#[derive(Default)]
pub struct MemoryDialogues {
    pub dialogues: DashMap<Uuid, Dialogue>,
    pub fail_bridge_lookups: bool,
}

impl MemoryDialogues {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, dialogue: Dialogue) -> Uuid {
        let id = dialogue.id;
        self.dialogues.insert(id, dialogue);
        id
    }

    pub fn remove(&self, id: Uuid) {
        self.dialogues.remove(&id);
    }
}

#[async_trait]
impl DialogueStore for MemoryDialogues {
    async fn dialogues_for_owner(&self, owner: &str, offset: usize, limit: usize) -> Result<Vec<Dialogue>> {
        let mut owned: Vec<Dialogue> = self
            .dialogues
            .iter()
            .filter(|entry| entry.value().owner == owner)
            .map(|entry| entry.value().clone())
            .collect();
        owned.sort_by_key(|d| (d.created, d.id));
        Ok(owned.into_iter().skip(offset).take(limit).collect())
    }

    async fn dialogue(&self, id: Uuid) -> Result<Option<Dialogue>> {
        Ok(self.dialogues.get(&id).map(|entry| entry.value().clone()))
    }

    async fn remote_dialogue_for_bridge(&self, bridge_id: Uuid, local_id: Uuid) -> Result<Option<Dialogue>> {
        if self.fail_bridge_lookups {
            return Err(NotifierError::request("bridge lookup failed"));
        }
        Ok(self
            .dialogues
            .iter()
            .find(|entry| entry.value().bridge_id == Some(bridge_id) && entry.value().id != local_id)
            .map(|entry| entry.value().clone()))
    }
}

/// Dialogue store that parks the first owner listing, after it has been
/// read, until released
pub struct GatedDialogues {
    pub inner: Arc<MemoryDialogues>,
    pub entered: Notify,
    pub release: Notify,
    gated: AtomicBool,
}

impl GatedDialogues {
    pub fn new(inner: Arc<MemoryDialogues>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            entered: Notify::new(),
            release: Notify::new(),
            gated: AtomicBool::new(true),
        })
    }
}

#[async_trait]
impl DialogueStore for GatedDialogues {
    async fn dialogues_for_owner(&self, owner: &str, offset: usize, limit: usize) -> Result<Vec<Dialogue>> {
        let listed = self.inner.dialogues_for_owner(owner, offset, limit).await?;
        if self.gated.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(listed)
    }

    async fn dialogue(&self, id: Uuid) -> Result<Option<Dialogue>> {
        self.inner.dialogue(id).await
    }

    async fn remote_dialogue_for_bridge(&self, bridge_id: Uuid, local_id: Uuid) -> Result<Option<Dialogue>> {
        self.inner.remote_dialogue_for_bridge(bridge_id, local_id).await
    }
}

#[derive(Default)]
pub struct MemoryBindings {
    pub bindings: Mutex<Vec<RegistrarBinding>>,
}

impl MemoryBindings {
    pub fn add(&self, account_id: Uuid, contact: &str, remote: Option<&str>) {
        self.bindings.lock().push(RegistrarBinding {
            id: Uuid::new_v4(),
            account_id,
            contact_uri: contact.parse().unwrap(),
            remote_end_point: remote.map(|r| SipEndPoint::udp(r.parse().unwrap())),
            expiry: 3600,
        });
    }
}

#[async_trait]
impl BindingStore for MemoryBindings {
    async fn bindings(&self, account_id: Uuid, offset: usize, limit: usize) -> Result<Vec<RegistrarBinding>> {
        Ok(self
            .bindings
            .lock()
            .iter()
            .filter(|b| b.account_id == account_id)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn binding_count(&self, account_id: Uuid) -> Result<usize> {
        Ok(self.bindings.lock().iter().filter(|b| b.account_id == account_id).count())
    }
}

#[derive(Default)]
pub struct MemoryAccounts {
    pub accounts: Mutex<Vec<SipAccount>>,
}

impl MemoryAccounts {
    pub fn add(&self, owner: &str, username: &str, domain: &str) -> SipAccount {
        let account = SipAccount::new(owner, username, domain);
        self.accounts.lock().push(account.clone());
        account
    }
}

#[async_trait]
impl AccountStore for MemoryAccounts {
    async fn account(&self, username: &str, domain: &str) -> Result<Option<SipAccount>> {
        Ok(self
            .accounts
            .lock()
            .iter()
            .find(|a| a.username.eq_ignore_ascii_case(username) && a.domain.eq_ignore_ascii_case(domain))
            .cloned())
    }
}

/// Telemetry sink that keeps every record
#[derive(Default)]
pub struct RecordingMonitor {
    pub records: Mutex<Vec<MonitorRecord>>,
}

impl RecordingMonitor {
    pub fn of_type(&self, event_type: MonitorEventType) -> Vec<MonitorRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.event_type == event_type)
            .cloned()
            .collect()
    }
}

impl MonitorSink for RecordingMonitor {
    fn publish(&self, record: MonitorRecord) {
        self.records.lock().push(record);
    }
}

/// Every collaborator a notifier needs, in memory
pub struct Harness {
    pub transport: Arc<RecordingTransport>,
    pub domains: Arc<MemoryDomains>,
    pub dialogues: Arc<MemoryDialogues>,
    pub bindings: Arc<MemoryBindings>,
    pub accounts: Arc<MemoryAccounts>,
    pub monitor: Arc<RecordingMonitor>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            transport: RecordingTransport::new(),
            domains: MemoryDomains::serving(&[DOMAIN]),
            dialogues: MemoryDialogues::new(),
            bindings: Arc::new(MemoryBindings::default()),
            accounts: Arc::new(MemoryAccounts::default()),
            monitor: Arc::new(RecordingMonitor::default()),
        }
    }

    pub fn config() -> NotifierConfig {
        NotifierConfig {
            sip_sockets: vec![local_end_point()],
            ..NotifierConfig::default()
        }
    }

    pub fn context(&self, config: NotifierConfig) -> NotifierContext {
        NotifierContext::new(
            config,
            self.domains.clone(),
            self.dialogues.clone(),
            self.bindings.clone(),
            self.accounts.clone(),
        )
        .with_monitor(self.monitor.clone())
    }
}

pub fn subscribe(user: &str, host: &str, call_id: &str, event: Option<&str>) -> Request {
    subscribe_from("sip:watcher@example.com", "w1", user, host, call_id, event, None)
}

pub fn subscribe_expiring(user: &str, host: &str, call_id: &str, event: &str, expires: u32) -> Request {
    subscribe_from("sip:watcher@example.com", "w1", user, host, call_id, Some(event), Some(expires))
}

/// SUBSCRIBE from an arbitrary watcher identity
pub fn subscribe_from(
    from: &str,
    from_tag: &str,
    user: &str,
    host: &str,
    call_id: &str,
    event: Option<&str>,
    expires: Option<u32>,
) -> Request {
    let target = format!("sip:{}@{}", user, host);
    let mut builder = SimpleRequestBuilder::new(Method::Subscribe, &target)
        .unwrap()
        .from("", from, Some(from_tag))
        .to("", &target, None)
        .call_id(call_id)
        .cseq(1)
        .via("10.0.0.9:5070", "UDP", Some("z9hG4bK-sub"))
        .max_forwards(70)
        .header(watcher_contact());
    if let Some(event) = event {
        builder = builder.event(event);
    }
    if let Some(expires) = expires {
        builder = builder.expires(expires);
    }
    builder.build()
}

pub fn watcher_contact() -> TypedHeader {
    TypedHeader::Contact(Contact::new_params(vec![ContactParamInfo {
        address: sip::address("sip:watcher@10.0.0.9:5070".parse().unwrap()),
    }]))
}

pub fn notify(target: &str, event: &str) -> Request {
    notify_with_hops(target, event, 70)
}

pub fn notify_with_hops(target: &str, event: &str, hops: u32) -> Request {
    SimpleRequestBuilder::new(Method::Notify, target)
        .unwrap()
        .from("", "sip:vm@example.com", Some("v1"))
        .to("", target, None)
        .call_id("notify-1")
        .cseq(1)
        .via("10.0.0.9:5070", "UDP", Some("z9hG4bK-not"))
        .max_forwards(hops)
        .event(event)
        .build()
}

/// Text of the first `name` header of a request
pub fn header(request: &Request, name: HeaderName) -> Option<String> {
    request.header(&name).map(sip::header_value)
}

/// Text of the first `name` header of a response
pub fn response_header(response: &Response, name: HeaderName) -> Option<String> {
    response.header(&name).map(sip::header_value)
}

pub fn to_tag(response: &Response) -> Option<String> {
    response.headers.iter().find_map(|header| match header {
        TypedHeader::To(to) => to.tag().map(str::to_string),
        _ => None,
    })
}

pub fn body_text(request: &Request) -> String {
    String::from_utf8_lossy(request.body()).to_string()
}

/// A dialog subscription for `owner` wired straight to the store
pub fn dialog_subscription(
    owner: &str,
    dialogues: Arc<dyn DialogueStore>,
    monitor: Arc<RecordingMonitor>,
) -> DialogEventSubscription {
    let resource: Uri = format!("sip:{}@{}", owner, DOMAIN).parse().unwrap();
    let mut local = sip::address(resource.clone());
    local.set_tag("local-tag");
    let mut remote: Address = sip::address("sip:watcher@example.com".parse().unwrap());
    remote.set_tag("w1");
    let dialogue = SubscriptionDialogue::new(
        "sub-call",
        "local-tag",
        local,
        remote,
        "sip:watcher@10.0.0.9:5070".parse().unwrap(),
        local_end_point(),
        remote_end_point(),
        owner,
    );
    let info = SubscriptionInfo::new("sub-call", resource.clone(), resource, None, Arc::new(dialogue), 3600);
    DialogEventSubscription::new(info, dialogues, monitor, 25)
}

pub fn machine_event(kind: MachineEventKind, owner: &str, id: impl ToString) -> MachineEvent {
    MachineEvent::new(
        kind,
        owner,
        id.to_string(),
        format!("sip:{}@{}", owner, DOMAIN).parse().unwrap(),
    )
}

/// Poll `condition` until it holds or a second has passed
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
