//! Loopback monitor channel
//!
//! Forwards telemetry records as JSON datagrams to a local monitoring
//! process listening on `127.0.0.1:<port>`.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{MonitorRecord, MonitorSink};
use crate::error::{NotifierError, Result};

/// Writes monitor records to the loopback monitoring socket
#[derive(Debug, Clone)]
pub struct MonitorEventWriter {
    destination: SocketAddr,
    tx: mpsc::UnboundedSender<MonitorRecord>,
}

impl MonitorEventWriter {
    /// Bind an ephemeral loopback socket and spawn the send loop.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn bind(port: u16) -> Result<Self> {
        let destination = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|e| NotifierError::startup(format!("Failed to bind monitor channel: {}", e)))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<MonitorRecord>();

        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let payload = match serde_json::to_vec(&record) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Failed to encode monitor record: {}", e);
                        continue;
                    }
                };
                if let Err(e) = socket.send_to(&payload, destination).await {
                    warn!("Failed to send monitor record to {}: {}", destination, e);
                }
            }
            debug!("Monitor channel to {} closed", destination);
        });

        Ok(Self { destination, tx })
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// Queue a record for sending; dropped silently once the loop has ended
    pub fn send(&self, record: MonitorRecord) {
        let _ = self.tx.send(record);
    }
}

impl MonitorSink for MonitorEventWriter {
    fn publish(&self, record: MonitorRecord) {
        self.send(record);
    }
}
