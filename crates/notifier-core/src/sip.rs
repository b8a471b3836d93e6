//! SIP message helpers
//!
//! Thin accessors over the `rvoip-sip-core` message types for the few headers
//! the notifier reads, and the response and URI shapes it builds.

use std::str::FromStr;

use rvoip_sip_core::builder::SimpleResponseBuilder;
use rvoip_sip_core::types::address::Address;
use rvoip_sip_core::types::contact::{Contact, ContactValue};
use rvoip_sip_core::types::expires::Expires;
use rvoip_sip_core::types::header::HeaderName;
use rvoip_sip_core::types::max_forwards::MaxForwards;
use rvoip_sip_core::types::uri::Host;
use rvoip_sip_core::types::TypedHeader;
use rvoip_sip_core::{Request, Response, StatusCode, Uri};

/// Event package carried by NAT keep-alive NOTIFYs
pub const KEEP_ALIVE_EVENT: &str = "keep-alive";

/// 489 Bad Event (RFC 6665)
pub const BAD_EVENT: StatusCode = StatusCode::Custom(489);

/// Text of a header after its `Name:` prefix
pub fn header_value(header: &TypedHeader) -> String {
    let line = header.to_string();
    match line.split_once(':') {
        Some((_, value)) => value.trim().to_string(),
        None => line,
    }
}

/// Lowercased package token of the Event header, parameters dropped
pub fn event_package(request: &Request) -> Option<String> {
    let value = header_value(request.header(&HeaderName::Event)?);
    let package = value.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    (!package.is_empty()).then_some(package)
}

pub fn is_keep_alive(request: &Request) -> bool {
    event_package(request).as_deref() == Some(KEEP_ALIVE_EVENT)
}

pub fn expires(request: &Request) -> Option<u32> {
    request.typed_header::<Expires>().map(|expires| expires.0)
}

pub fn max_forwards(request: &Request) -> Option<u8> {
    request.typed_header::<MaxForwards>().map(|hops| hops.0)
}

/// URI of the first Contact entry
pub fn contact_uri(request: &Request) -> Option<Uri> {
    request
        .typed_header::<Contact>()
        .and_then(|contact| contact.0.first())
        .and_then(|value| match value {
            ContactValue::Params(params) => params.first().map(|p| p.address.uri.clone()),
            _ => None,
        })
}

/// User part of a URI, when present and not blank
pub fn user(uri: &Uri) -> Option<&str> {
    uri.user.as_deref().map(str::trim).filter(|user| !user.is_empty())
}

/// Host of a URI as the domain resolver sees it
pub fn host(uri: &Uri) -> String {
    uri.host.to_string()
}

/// `scheme:user@host` with the host lowercased and no port or parameters
pub fn aor(uri: &Uri) -> String {
    let host = host(uri).to_ascii_lowercase();
    match user(uri) {
        Some(user) => format!("{}:{}@{}", uri.scheme, user, host),
        None => format!("{}:{}", uri.scheme, host),
    }
}

/// Copy of `uri` pointing at `host`
pub fn with_host(uri: &Uri, host: &str) -> Uri {
    let mut uri = uri.clone();
    uri.host = Host::from_str(host).unwrap_or_else(|_| Host::domain(host));
    uri.raw_uri = None;
    uri
}

/// Name-addr for `uri` with no display name or parameters
pub fn address(uri: Uri) -> Address {
    Address {
        display_name: None,
        uri,
        params: vec![],
    }
}

/// Response carrying the request's Via, From, To, Call-ID and CSeq
pub fn response_for(request: &Request, status: StatusCode, reason: Option<&str>) -> Response {
    let reason = match reason {
        None if status == BAD_EVENT => Some("Bad Event"),
        reason => reason,
    };
    SimpleResponseBuilder::response_from_request(request, status, reason).build()
}

/// Put `tag` on the response's To header
pub fn set_to_tag(response: &mut Response, tag: &str) {
    for header in response.headers.iter_mut() {
        if let TypedHeader::To(to) = header {
            to.set_tag(tag);
        }
    }
}

/// Remote tag of the request's From header
pub fn from_tag(request: &Request) -> Option<String> {
    request.from().and_then(|from| from.tag()).map(str::to_string)
}
