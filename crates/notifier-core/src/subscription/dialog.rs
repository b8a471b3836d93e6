//! Dialog event package subscription (RFC 4235)

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::dialog_info::{DialogDeltaItem, DialogEventAggregate, DialogInfoState, DialogItemState};
use super::{EventPackage, EventSubscription, SubscriptionInfo};
use crate::context::{Dialogue, DialogueStore};
use crate::error::{NotifierError, Result};
use crate::monitor::{MachineEvent, MachineEventKind, MonitorEventType, MonitorRecord, MonitorSink};

/// Subscription to the dialog state of one account
pub struct DialogEventSubscription {
    info: SubscriptionInfo,
    dialogues: Arc<dyn DialogueStore>,
    monitor: Arc<dyn MonitorSink>,
    max_dialogues: usize,
    aggregate: Mutex<DialogEventAggregate>,
}

impl std::fmt::Debug for DialogEventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialogEventSubscription")
            .field("info", &self.info)
            .field("max_dialogues", &self.max_dialogues)
            .field("aggregate", &self.aggregate.try_lock().map(|a| a.clone()))
            .finish()
    }
}

impl DialogEventSubscription {
    pub fn new(
        info: SubscriptionInfo,
        dialogues: Arc<dyn DialogueStore>,
        monitor: Arc<dyn MonitorSink>,
        max_dialogues: usize,
    ) -> Self {
        let aggregate = DialogEventAggregate::new(info.resource_uri.clone());
        Self {
            info,
            dialogues,
            monitor,
            max_dialogues,
            aggregate: Mutex::new(aggregate),
        }
    }

    /// Current version counter
    pub fn version(&self) -> u64 {
        self.aggregate.lock().version()
    }

    /// Current full/partial flag
    pub fn state(&self) -> DialogInfoState {
        self.aggregate.lock().state()
    }

    /// Snapshot of the deltas not yet sent
    pub fn pending(&self) -> Vec<DialogDeltaItem> {
        self.aggregate.lock().pending().to_vec()
    }

    fn publish(&self, event_type: MonitorEventType, message: String) {
        self.monitor
            .publish(MonitorRecord::notifier(event_type, message, Some(self.info.owner())));
    }

    async fn lookup(&self, resource_id: &str) -> Result<Option<Dialogue>> {
        // An id that is not a dialogue id cannot name a live dialogue
        match resource_id.parse::<Uuid>() {
            Ok(id) => self.dialogues.dialogue(id).await,
            Err(_) => {
                debug!("Machine event resource {} is not a dialogue id", resource_id);
                Ok(None)
            }
        }
    }

    /// Work out the delta items for one event. Store lookups happen here,
    /// outside the aggregate lock.
    async fn resolve_items(&self, event: &MachineEvent) -> Result<Vec<DialogDeltaItem>> {
        let state = match event.kind {
            MachineEventKind::DialogueCreated => DialogItemState::Confirmed,
            MachineEventKind::DialogueRemoved => {
                return Ok(vec![DialogDeltaItem::terminated(event.resource_id.clone())]);
            }
            MachineEventKind::DialogueUpdated | MachineEventKind::DialogueTransfer => DialogItemState::Updated,
            other => {
                return Err(NotifierError::invariant(format!(
                    "The state for a dialog event could not be determined from the machine event type of {}",
                    other
                )));
            }
        };

        let Some(dialogue) = self.lookup(&event.resource_id).await? else {
            // Not in the store any more, so the call has ended
            return Ok(vec![DialogDeltaItem::terminated(event.resource_id.clone())]);
        };

        let mut items = Vec::with_capacity(2);
        let bridge = match event.kind {
            MachineEventKind::DialogueTransfer => dialogue.bridge_id.map(|bridge_id| (bridge_id, dialogue.id)),
            _ => None,
        };
        items.push(DialogDeltaItem::new(dialogue, state));

        if let Some((bridge_id, local_id)) = bridge {
            match self.dialogues.remote_dialogue_for_bridge(bridge_id, local_id).await {
                Ok(Some(peer)) => items.push(DialogDeltaItem::new(peer, state)),
                Ok(None) => debug!("No bridged peer for dialogue {} on bridge {}", local_id, bridge_id),
                Err(e) => warn!("Bridged peer lookup for dialogue {} failed: {}", local_id, e),
            }
        }

        Ok(items)
    }

    fn record_sent(&self, aggregate: &DialogEventAggregate) {
        let cseq = self.info.dialogue.cseq();
        match aggregate.state() {
            DialogInfoState::Full => self.publish(
                MonitorEventType::NotifySent,
                format!(
                    "Full state notification sent for {}, version {}, cseq {}.",
                    aggregate.entity(),
                    aggregate.version(),
                    cseq
                ),
            ),
            DialogInfoState::Partial => {
                for item in aggregate.pending() {
                    let remote = item
                        .remote_participant()
                        .map(|uri| format!(", {}", uri))
                        .unwrap_or_default();
                    self.publish(
                        MonitorEventType::NotifySent,
                        format!(
                            "Partial state notification sent for {} dialog ID {} {}, version {}{}, cseq {}.",
                            aggregate.entity(),
                            item.id,
                            item.state,
                            aggregate.version(),
                            remote,
                            cseq
                        ),
                    );
                }
            }
        }
    }
}

#[async_trait]
impl EventSubscription for DialogEventSubscription {
    fn info(&self) -> &SubscriptionInfo {
        &self.info
    }

    fn event_package(&self) -> EventPackage {
        EventPackage::Dialog
    }

    async fn get_full_state(&self) -> Result<()> {
        let dialogues = self
            .dialogues
            .dialogues_for_owner(self.info.owner(), 0, self.max_dialogues)
            .await?;

        let items = dialogues
            .into_iter()
            .take(self.max_dialogues)
            .map(|dialogue| DialogDeltaItem::new(dialogue, DialogItemState::Confirmed));

        let (loaded, count) = {
            let mut aggregate = self.aggregate.lock();
            let loaded = aggregate.load_full_state(items);
            (loaded, aggregate.pending().len())
        };
        if !loaded {
            debug!(
                "Full state for dialog {} ignored, a baseline was already sent",
                self.info.resource_uri
            );
            return Ok(());
        }

        self.publish(
            MonitorEventType::NotifySent,
            format!(
                "Full state loaded for dialog {} ({} dialogues).",
                self.info.resource_uri, count
            ),
        );
        Ok(())
    }

    fn notify_body(&self) -> Result<String> {
        self.aggregate.lock().to_xml()
    }

    async fn add_monitor_event(&self, event: &MachineEvent) -> Result<bool> {
        let items = match self.resolve_items(event).await {
            Ok(items) => items,
            Err(e) => {
                self.publish(MonitorEventType::Error, format!("Monitor event for dialog {} rejected: {}", self.info.resource_uri, e));
                return Err(e);
            }
        };

        let mut aggregate = self.aggregate.lock();
        self.publish(
            MonitorEventType::Monitor,
            format!(
                "Monitor event {} dialog {} (ID {}).",
                event.kind, self.info.resource_uri, event.resource_id
            ),
        );
        for item in items {
            aggregate.push(item);
        }
        // Held for the first full-state document until its snapshot is in
        Ok(aggregate.has_baseline())
    }

    fn notification_sent(&self) {
        let mut aggregate = self.aggregate.lock();
        self.record_sent(&aggregate);
        aggregate.mark_sent();
    }

    fn flush(&self, dispatch: &mut (dyn FnMut(String) -> Result<()> + Send)) -> Result<()> {
        let mut aggregate = self.aggregate.lock();
        let body = aggregate.to_xml()?;
        dispatch(body)?;
        self.record_sent(&aggregate);
        aggregate.mark_sent();
        Ok(())
    }
}
