//! Transport collaborator contract
//!
//! Socket I/O, message parsing and retransmission live behind [`Transport`].
//! The notifier hands it `rvoip-sip-core` requests/responses and consumes the inbound
//! [`TransportEvent`] stream it returns from [`Transport::start`].

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use rvoip_sip_core::{Request, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

/// Transport protocol of a SIP channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SipProtocol {
    Udp,
    Tcp,
    Tls,
    Ws,
}

impl fmt::Display for SipProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SipProtocol::Udp => "udp",
            SipProtocol::Tcp => "tcp",
            SipProtocol::Tls => "tls",
            SipProtocol::Ws => "ws",
        };
        f.write_str(name)
    }
}

/// A protocol + socket address pair identifying one end of a SIP exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SipEndPoint {
    pub protocol: SipProtocol,
    pub address: SocketAddr,
}

impl SipEndPoint {
    pub fn new(protocol: SipProtocol, address: SocketAddr) -> Self {
        Self { protocol, address }
    }

    pub fn udp(address: SocketAddr) -> Self {
        Self::new(SipProtocol::Udp, address)
    }
}

impl fmt::Display for SipEndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.address)
    }
}

/// Events delivered by the transport layer
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A parsed inbound request
    RequestReceived {
        local: SipEndPoint,
        remote: SipEndPoint,
        request: Request,
    },
    /// A parsed inbound response (NOTIFY acknowledgements)
    ResponseReceived {
        local: SipEndPoint,
        remote: SipEndPoint,
        response: Response,
    },
    /// Non-fatal transport error
    Error { error: String },
    /// The transport has closed
    Closed,
}

/// SIP transport used by the notifier
///
/// Implementations must be safe to call from many tasks at once.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the given channels and return the inbound event stream
    async fn start(&self, channels: &[SipEndPoint]) -> Result<mpsc::Receiver<TransportEvent>>;

    /// Send a response back along the request's Via path
    async fn send_response(&self, response: Response) -> Result<()>;

    /// Send a request to an explicit destination
    async fn send_request(&self, destination: SipEndPoint, request: Request) -> Result<()>;

    /// Close all channels
    async fn shutdown(&self) -> Result<()>;
}
