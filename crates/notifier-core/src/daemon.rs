//! Notifier daemon lifecycle
//!
//! [`NotifierDaemon`] wires the transport, the subscription manager, the notify
//! queue/relay and the request dispatcher together. `start` fails only on
//! missing mandatory configuration; everything after that is logged and
//! swallowed so the hosting process keeps running.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::NotifierContext;
use crate::dispatcher::RequestDispatcher;
use crate::error::Result;
use crate::manager::SubscriptionManager;
use crate::monitor::{MachineEvent, MonitorEventType, MonitorEventWriter, MonitorRecord, MonitorSink};
use crate::notify::{NotifyManager, NotifyQueue};
use crate::transport::{Transport, TransportEvent};

/// Capacity of the machine event channel handed to event producers
pub const MACHINE_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The shared telemetry callback every component publishes through
///
/// Logs each record, then forwards it to the loopback monitor channel (once
/// started) and to the configured publisher.
struct DaemonMonitor {
    writer: RwLock<Option<MonitorEventWriter>>,
    publisher: Arc<dyn MonitorSink>,
}

impl MonitorSink for DaemonMonitor {
    fn publish(&self, record: MonitorRecord) {
        if record.event_type != MonitorEventType::NatKeepAlive {
            debug!("{}", record.message);
        }
        if let Some(writer) = self.writer.read().as_ref() {
            writer.send(record.clone());
        }
        self.publisher.publish(record);
    }
}

struct Running {
    manager: Arc<SubscriptionManager>,
    notify_queue: Arc<NotifyQueue>,
    notify_manager: Arc<NotifyManager>,
    receive_loop: JoinHandle<()>,
}

enum DaemonState {
    Idle,
    Starting,
    Running(Running),
    Stopped,
}

/// SUBSCRIBE/NOTIFY notifier daemon
pub struct NotifierDaemon {
    context: NotifierContext,
    monitor: Arc<DaemonMonitor>,
    transport: Arc<dyn Transport>,
    machine_tx: mpsc::Sender<MachineEvent>,
    machine_rx: Mutex<Option<mpsc::Receiver<MachineEvent>>>,
    state: Mutex<DaemonState>,
}

impl NotifierDaemon {
    pub fn new(context: NotifierContext, transport: Arc<dyn Transport>) -> Self {
        let monitor = Arc::new(DaemonMonitor {
            writer: RwLock::new(None),
            publisher: context.monitor.clone(),
        });
        let context = context.with_monitor(monitor.clone());
        let (machine_tx, machine_rx) = mpsc::channel(MACHINE_EVENT_CHANNEL_CAPACITY);

        Self {
            context,
            monitor,
            transport,
            machine_tx,
            machine_rx: Mutex::new(Some(machine_rx)),
            state: Mutex::new(DaemonState::Idle),
        }
    }

    /// Channel on which the platform reports dialogue changes
    pub fn machine_event_sender(&self) -> mpsc::Sender<MachineEvent> {
        self.machine_tx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), DaemonState::Running(_))
    }

    /// The live subscription manager, while running
    pub fn subscription_manager(&self) -> Option<Arc<SubscriptionManager>> {
        match &*self.state.lock() {
            DaemonState::Running(running) => Some(running.manager.clone()),
            _ => None,
        }
    }

    /// Publish a telemetry record through the daemon's shared callback
    pub fn fire_monitor_event(&self, record: MonitorRecord) {
        self.monitor.publish(record);
    }

    /// Start the notifier. Only missing mandatory configuration is returned
    /// as an error; other startup failures are logged.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match &*state {
                DaemonState::Idle => {}
                DaemonState::Starting | DaemonState::Running(_) => {
                    warn!("SIP Notifier daemon is already running");
                    return Ok(());
                }
                DaemonState::Stopped => {
                    warn!("SIP Notifier daemon has been stopped and cannot be restarted");
                    return Ok(());
                }
            }
            *state = DaemonState::Starting;
        }

        info!("SIP Notifier daemon starting...");
        if let Err(e) = self.context.config.validate() {
            *self.state.lock() = DaemonState::Idle;
            return Err(e);
        }

        if let Err(e) = self.start_components().await {
            error!("SIP Notifier daemon failed to start: {}", e);
            // The loopback channel may already be open when a later step fails
            self.monitor.writer.write().take();
            *self.state.lock() = DaemonState::Idle;
        }
        Ok(())
    }

    async fn start_components(&self) -> Result<()> {
        let config = self.context.config.clone();

        if let Some(port) = config.monitor_loopback_port {
            let writer = MonitorEventWriter::bind(port).await?;
            debug!("Monitor channel initialised for {}", writer.destination());
            *self.monitor.writer.write() = Some(writer);
        }

        let events = self.transport.start(&config.sip_sockets).await?;
        for socket in &config.sip_sockets {
            info!("SIP Notifier listening on {}", socket);
        }

        let notify_queue = NotifyQueue::start(self.transport.clone());
        let manager = Arc::new(SubscriptionManager::new(
            self.context.clone(),
            self.transport.clone(),
            notify_queue.clone(),
        ));
        if let Some(machine_rx) = self.machine_rx.lock().take() {
            manager.spawn_event_listener(machine_rx);
        }

        let notify_manager = NotifyManager::start(self.context.clone(), self.transport.clone());
        let dispatcher = Arc::new(RequestDispatcher::new(
            &self.context,
            self.transport.clone(),
            manager.clone(),
            notify_manager.clone(),
        ));
        let receive_loop = spawn_receive_loop(dispatcher, events);

        *self.state.lock() = DaemonState::Running(Running {
            manager,
            notify_queue,
            notify_manager,
            receive_loop,
        });

        self.fire_monitor_event(MonitorRecord::notifier(
            MonitorEventType::Monitor,
            "SIP Notifier daemon successfully started.",
            None,
        ));
        info!("SIP Notifier daemon successfully started");
        Ok(())
    }

    /// Stop every component. Each step is isolated so one failure does not
    /// prevent the rest from stopping. Safe to call more than once.
    pub async fn stop(&self) {
        let running = {
            let mut state = self.state.lock();
            if !matches!(*state, DaemonState::Running(_)) {
                debug!("SIP Notifier daemon stop requested while not running");
                return;
            }
            match std::mem::replace(&mut *state, DaemonState::Stopped) {
                DaemonState::Running(running) => running,
                _ => return,
            }
        };

        info!("SIP Notifier daemon stopping...");

        running.manager.stop();

        if let Err(e) = running.notify_manager.stop().await {
            error!("Failed to stop notify relay: {}", e);
        }
        if let Err(e) = running.notify_queue.stop().await {
            error!("Failed to stop notify queue: {}", e);
        }
        if let Err(e) = self.transport.shutdown().await {
            error!("Failed to shut down SIP transport: {}", e);
        }

        running.receive_loop.abort();
        *self.monitor.writer.write() = None;
        info!("SIP Notifier daemon stopped");
    }
}

fn spawn_receive_loop(
    dispatcher: Arc<RequestDispatcher>,
    mut events: mpsc::Receiver<TransportEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::RequestReceived { local, remote, request } => {
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        dispatcher.handle_request(local, remote, request).await;
                    });
                }
                TransportEvent::ResponseReceived { remote, response, .. } => {
                    debug!(
                        "Response {} {} from {}",
                        response.status().as_u16(),
                        response.reason_phrase(),
                        remote
                    );
                }
                TransportEvent::Error { error } => {
                    warn!("Transport error: {}", error);
                }
                TransportEvent::Closed => {
                    info!("Transport closed");
                    break;
                }
            }
        }
    })
}

impl std::fmt::Debug for NotifierDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifierDaemon")
            .field("context", &self.context)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for NotifierDaemon {
    fn drop(&mut self) {
        if let DaemonState::Running(running) = &*self.state.lock() {
            running.receive_loop.abort();
        }
    }
}
