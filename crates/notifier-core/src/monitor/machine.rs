//! Machine events: internal notifications that platform state changed

use std::fmt;

use chrono::{DateTime, Utc};
use rvoip_sip_core::Uri;
use serde::{Deserialize, Serialize};

use crate::subscription::EventPackage;

/// Kind of state change carried by a [`MachineEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineEventKind {
    DialogueCreated,
    DialogueRemoved,
    DialogueUpdated,
    DialogueTransfer,
    RegistrarBindingUpdate,
    RegistrarBindingRemoval,
}

impl MachineEventKind {
    /// Event package whose subscribers care about this kind
    pub fn package(&self) -> EventPackage {
        match self {
            MachineEventKind::DialogueCreated
            | MachineEventKind::DialogueRemoved
            | MachineEventKind::DialogueUpdated
            | MachineEventKind::DialogueTransfer => EventPackage::Dialog,
            MachineEventKind::RegistrarBindingUpdate | MachineEventKind::RegistrarBindingRemoval => {
                EventPackage::Presence
            }
        }
    }
}

impl fmt::Display for MachineEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MachineEventKind::DialogueCreated => "DialogueCreated",
            MachineEventKind::DialogueRemoved => "DialogueRemoved",
            MachineEventKind::DialogueUpdated => "DialogueUpdated",
            MachineEventKind::DialogueTransfer => "DialogueTransfer",
            MachineEventKind::RegistrarBindingUpdate => "RegistrarBindingUpdate",
            MachineEventKind::RegistrarBindingRemoval => "RegistrarBindingRemoval",
        };
        f.write_str(name)
    }
}

/// A state change for one resource, published by the proxy/app-server side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineEvent {
    pub kind: MachineEventKind,
    /// Account owner the resource belongs to
    pub owner: String,
    /// Dialogue id (string form) or binding id
    pub resource_id: String,
    /// Address-of-record the change applies to
    pub resource_uri: Uri,
    pub created: DateTime<Utc>,
}

impl MachineEvent {
    pub fn new(
        kind: MachineEventKind,
        owner: impl Into<String>,
        resource_id: impl Into<String>,
        resource_uri: Uri,
    ) -> Self {
        Self {
            kind,
            owner: owner.into(),
            resource_id: resource_id.into(),
            resource_uri,
            created: Utc::now(),
        }
    }
}
