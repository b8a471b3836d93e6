//! Tests for relaying account-addressed NOTIFYs to registered contacts

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;
use rvoip_sip_core::types::header::HeaderName;

use common::*;
use rvoip_notifier_core::prelude::*;
use rvoip_notifier_core::NotifyManager;

struct Fixture {
    harness: Harness,
    account: SipAccount,
    relay: Arc<NotifyManager>,
}

fn fixture_with(config: NotifierConfig) -> Fixture {
    let harness = Harness::new();
    let account = harness.accounts.add("alice-owner", "alice", DOMAIN);
    let relay = NotifyManager::start(harness.context(config), harness.transport.clone());
    Fixture { harness, account, relay }
}

fn fixture() -> Fixture {
    fixture_with(Harness::config())
}

impl Fixture {
    async fn relay(&self, request: Request) -> Response {
        self.relay.queue_notification(request).unwrap();
        let transport = self.harness.transport.clone();
        assert!(wait_until(|| !transport.responses().is_empty()).await);
        transport.responses().remove(0)
    }
}

#[tokio::test]
async fn test_notify_is_forwarded_to_every_binding() {
    let f = fixture();
    f.harness
        .bindings
        .add(f.account.id, "sip:alice@192.168.1.20:5062", Some("203.0.113.7:40000"));
    f.harness.bindings.add(f.account.id, "sip:alice@192.168.1.30", None);

    let response = f.relay(notify("sip:alice@example.com", "message-summary")).await;
    assert_eq!(response.status(), StatusCode::Ok);

    let forwarded = f.harness.transport.requests();
    assert_eq!(forwarded.len(), 2);
    assert_eq!(forwarded[0].0.address, "203.0.113.7:40000".parse().unwrap());
    assert_eq!(forwarded[0].1.uri.to_string(), "sip:alice@192.168.1.20:5062");
    assert_eq!(forwarded[1].0.address, "192.168.1.30:5060".parse().unwrap());
    assert!(forwarded
        .iter()
        .all(|(_, r)| header(r, HeaderName::MaxForwards).as_deref() == Some("69")));
    assert!(forwarded
        .iter()
        .all(|(_, r)| header(r, HeaderName::Event).as_deref() == Some("message-summary")));

    assert_eq!(f.harness.monitor.of_type(MonitorEventType::NotifierRelay).len(), 2);
    f.relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_account_gets_404() {
    let f = fixture();

    let response = f.relay(notify("sip:nobody@example.com", "message-summary")).await;

    assert_eq!(response.status(), StatusCode::NotFound);
    assert_eq!(response.reason_phrase(), "Not found");
    assert!(f.harness.transport.requests().is_empty());
}

#[tokio::test]
async fn test_account_without_bindings_gets_480() {
    let f = fixture();

    let response = f.relay(notify("sip:alice@example.com", "message-summary")).await;

    assert_eq!(response.status(), StatusCode::TemporarilyUnavailable);
    assert!(f.harness.transport.requests().is_empty());
}

#[tokio::test]
async fn test_unreachable_bindings_get_480() {
    let f = fixture();
    // Named host, no source address and no proxy: nowhere to send it
    f.harness.bindings.add(f.account.id, "sip:alice@phone.example.com", None);

    let response = f.relay(notify("sip:alice@example.com", "message-summary")).await;

    assert_eq!(response.status(), StatusCode::TemporarilyUnavailable);
    assert!(f.harness.transport.requests().is_empty());
    let records = f.harness.monitor.of_type(MonitorEventType::NotifierRelay);
    assert_eq!(records.len(), 1);
    assert!(records[0].message.contains("none of 1 bindings reachable"));
}

#[tokio::test]
async fn test_exhausted_max_forwards_gets_483() {
    let f = fixture();
    f.harness
        .bindings
        .add(f.account.id, "sip:alice@192.168.1.20:5062", Some("203.0.113.7:40000"));

    let response = f
        .relay(notify_with_hops("sip:alice@example.com", "message-summary", 0))
        .await;

    assert_eq!(response.status(), StatusCode::TooManyHops);
    assert!(f.harness.transport.requests().is_empty());
    assert_eq!(f.harness.domains.lookups(), 0);
}

#[tokio::test]
async fn test_last_hop_is_forwarded_with_zero_max_forwards() {
    let f = fixture();
    f.harness
        .bindings
        .add(f.account.id, "sip:alice@192.168.1.20:5062", Some("203.0.113.7:40000"));

    let response = f
        .relay(notify_with_hops("sip:alice@example.com", "message-summary", 1))
        .await;

    assert_eq!(response.status(), StatusCode::Ok);
    let forwarded = f.harness.transport.requests();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(header(&forwarded[0].1, HeaderName::MaxForwards).as_deref(), Some("0"));
}

#[tokio::test]
async fn test_forwarding_uses_outbound_proxy() {
    let proxy = SipEndPoint::udp("10.0.0.5:5060".parse().unwrap());
    let f = fixture_with(NotifierConfig {
        outbound_proxy: Some(proxy),
        ..Harness::config()
    });
    f.harness
        .bindings
        .add(f.account.id, "sip:alice@192.168.1.20:5062", Some("203.0.113.7:40000"));

    f.relay(notify("sip:alice@example.com", "message-summary")).await;

    let forwarded = f.harness.transport.requests();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].0, proxy);
    assert_eq!(forwarded[0].1.uri.to_string(), "sip:alice@192.168.1.20:5062");
}

#[tokio::test]
async fn test_queue_after_stop_is_refused() {
    let f = fixture();
    f.relay.stop().await.unwrap();
    f.relay.stop().await.unwrap();

    let result = f.relay.queue_notification(notify("sip:alice@example.com", "message-summary"));
    assert!(matches!(result, Err(NotifierError::Shutdown)));
}
