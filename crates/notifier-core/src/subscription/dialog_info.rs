//! RFC 4235 dialog-info payload
//!
//! [`DialogEventAggregate`] is the per-subscription state behind a dialog
//! event NOTIFY: the watched entity, a version counter, the full/partial flag
//! and the deltas waiting to be sent. Items are removed only by
//! [`DialogEventAggregate::mark_sent`], so nothing is delivered twice and
//! nothing appended after a flush is lost. Deltas that arrive before the
//! first snapshot is loaded are folded into that snapshot.

use std::fmt;
use std::io::Cursor;

use quick_xml::events::{BytesDecl, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use rvoip_sip_core::Uri;

use crate::context::{Dialogue, DialogueDirection};
use crate::error::{NotifierError, Result};

const DIALOG_INFO_NAMESPACE: &str = "urn:ietf:params:xml:ns:dialog-info";

/// Whether a document carries the complete state or only changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogInfoState {
    Full,
    Partial,
}

impl DialogInfoState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DialogInfoState::Full => "full",
            DialogInfoState::Partial => "partial",
        }
    }
}

impl fmt::Display for DialogInfoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State reported for one dialog element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogItemState {
    Confirmed,
    Terminated,
    Updated,
}

impl DialogItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DialogItemState::Confirmed => "confirmed",
            DialogItemState::Terminated => "terminated",
            DialogItemState::Updated => "updated",
        }
    }
}

impl fmt::Display for DialogItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dialog element waiting to be sent
#[derive(Debug, Clone, PartialEq)]
pub struct DialogDeltaItem {
    pub id: String,
    pub state: DialogItemState,
    /// Absent when the dialogue is known to be gone
    pub dialogue: Option<Dialogue>,
}

impl DialogDeltaItem {
    pub fn new(dialogue: Dialogue, state: DialogItemState) -> Self {
        Self {
            id: dialogue.id.to_string(),
            state,
            dialogue: Some(dialogue),
        }
    }

    pub fn terminated(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: DialogItemState::Terminated,
            dialogue: None,
        }
    }

    pub fn remote_participant(&self) -> Option<&Uri> {
        self.dialogue.as_ref().and_then(|d| d.remote_uri.as_ref())
    }
}

/// Versioned dialog-info state for one subscription
#[derive(Debug, Clone)]
pub struct DialogEventAggregate {
    entity: Uri,
    version: u64,
    state: DialogInfoState,
    pending: Vec<DialogDeltaItem>,
    snapshot_loaded: bool,
}

impl DialogEventAggregate {
    pub fn new(entity: Uri) -> Self {
        Self {
            entity,
            version: 0,
            state: DialogInfoState::Full,
            pending: Vec::new(),
            snapshot_loaded: false,
        }
    }

    pub fn entity(&self) -> &Uri {
        &self.entity
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn state(&self) -> DialogInfoState {
        self.state
    }

    pub fn pending(&self) -> &[DialogDeltaItem] {
        &self.pending
    }

    /// Whether the subscriber has, or is about to get, a complete baseline.
    /// Until then deltas are held rather than sent.
    pub fn has_baseline(&self) -> bool {
        self.snapshot_loaded || self.version > 0
    }

    /// Install a complete snapshot as the pending content.
    ///
    /// Deltas already pending were raised while the snapshot was being read,
    /// so they are newer than it: each one replaces the snapshot entry with
    /// the same id or is appended. Once a document has gone out the
    /// subscriber holds a baseline and the snapshot is ignored, returning
    /// `false`.
    pub fn load_full_state(&mut self, items: impl IntoIterator<Item = DialogDeltaItem>) -> bool {
        if self.version > 0 {
            return false;
        }

        let deltas = std::mem::take(&mut self.pending);
        self.pending.extend(items);
        for delta in deltas {
            match self.pending.iter_mut().find(|item| item.id == delta.id) {
                Some(item) => *item = delta,
                None => self.pending.push(delta),
            }
        }
        self.state = DialogInfoState::Full;
        self.snapshot_loaded = true;
        true
    }

    pub fn push(&mut self, item: DialogDeltaItem) {
        self.pending.push(item);
    }

    /// Discard what was sent, switch to partial and bump the version
    pub fn mark_sent(&mut self) {
        self.pending.clear();
        self.state = DialogInfoState::Partial;
        self.version += 1;
    }

    /// Render the aggregate as an `application/dialog-info+xml` document
    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

        write(&mut writer, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let version = self.version.to_string();
        let entity = self.entity.to_string();
        let mut root = BytesStart::new("dialog-info");
        root.push_attribute(("xmlns", DIALOG_INFO_NAMESPACE));
        root.push_attribute(("version", version.as_str()));
        root.push_attribute(("state", self.state.as_str()));
        root.push_attribute(("entity", entity.as_str()));

        if self.pending.is_empty() {
            write(&mut writer, Event::Empty(root))?;
        } else {
            write(&mut writer, Event::Start(root))?;
            for item in &self.pending {
                write_dialog(&mut writer, item)?;
            }
            write(&mut writer, Event::End(BytesStart::new("dialog-info").to_end()))?;
        }

        let xml = writer.into_inner().into_inner();
        String::from_utf8(xml).map_err(|e| NotifierError::notify_body(e.to_string()))
    }
}

fn write<'a>(writer: &mut Writer<Cursor<Vec<u8>>>, event: Event<'a>) -> Result<()> {
    writer
        .write_event(event)
        .map_err(|e| NotifierError::notify_body(e.to_string()))
}

fn write_text_element(writer: &mut Writer<Cursor<Vec<u8>>>, name: &str, text: &str) -> Result<()> {
    write(writer, Event::Start(BytesStart::new(name)))?;
    write(writer, Event::Text(BytesText::new(text)))?;
    write(writer, Event::End(BytesStart::new(name).to_end()))
}

fn write_dialog(writer: &mut Writer<Cursor<Vec<u8>>>, item: &DialogDeltaItem) -> Result<()> {
    let mut element = BytesStart::new("dialog");
    element.push_attribute(("id", item.id.as_str()));
    if let Some(dialogue) = &item.dialogue {
        element.push_attribute(("call-id", dialogue.call_id.as_str()));
        element.push_attribute(("local-tag", dialogue.local_tag.as_str()));
        element.push_attribute(("remote-tag", dialogue.remote_tag.as_str()));
        let direction = match dialogue.direction {
            DialogueDirection::Initiator => "initiator",
            DialogueDirection::Recipient => "recipient",
        };
        element.push_attribute(("direction", direction));
    }
    write(writer, Event::Start(element))?;

    write_text_element(writer, "state", item.state.as_str())?;

    if let Some(dialogue) = &item.dialogue {
        if let Some(local) = &dialogue.local_uri {
            write(writer, Event::Start(BytesStart::new("local")))?;
            write_text_element(writer, "identity", &local.to_string())?;
            write(writer, Event::End(BytesStart::new("local").to_end()))?;
        }
        if let Some(remote) = &dialogue.remote_uri {
            let remote = remote.to_string();
            write(writer, Event::Start(BytesStart::new("remote")))?;
            write_text_element(writer, "identity", &remote)?;
            let mut target = BytesStart::new("target");
            target.push_attribute(("uri", remote.as_str()));
            write(writer, Event::Empty(target))?;
            write(writer, Event::End(BytesStart::new("remote").to_end()))?;
        }
    }

    write(writer, Event::End(BytesStart::new("dialog").to_end()))
}

/// Parsed view of a dialog-info document
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DialogInfoDocument {
    pub entity: String,
    pub version: u64,
    pub state: String,
    pub dialogs: Vec<DialogInfoElement>,
}

/// Parsed `<dialog>` element
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DialogInfoElement {
    pub id: String,
    pub state: String,
    pub remote_identity: Option<String>,
}

impl DialogInfoDocument {
    /// Parse a dialog-info document, e.g. one received from a peer notifier
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut document = DialogInfoDocument::default();
        let mut current: Option<DialogInfoElement> = None;
        let mut in_state = false;
        let mut in_remote = false;
        let mut in_remote_identity = false;
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                    b"dialog-info" => {
                        for attr in e.attributes().flatten() {
                            let value = attr
                                .unescape_value()
                                .map_err(|err| NotifierError::notify_body(err.to_string()))?;
                            match attr.key.as_ref() {
                                b"entity" => document.entity = value.to_string(),
                                b"state" => document.state = value.to_string(),
                                b"version" => {
                                    document.version = value.parse().map_err(|_| {
                                        NotifierError::notify_body(format!("Invalid version: {}", value))
                                    })?
                                }
                                _ => {}
                            }
                        }
                    }
                    b"dialog" => {
                        let mut element = DialogInfoElement::default();
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"id" {
                                element.id = attr
                                    .unescape_value()
                                    .map_err(|err| NotifierError::notify_body(err.to_string()))?
                                    .to_string();
                            }
                        }
                        current = Some(element);
                    }
                    b"state" => in_state = true,
                    b"remote" => in_remote = true,
                    b"identity" if in_remote => in_remote_identity = true,
                    _ => {}
                },
                Ok(Event::Text(ref e)) => {
                    let text = e
                        .unescape()
                        .map_err(|err| NotifierError::notify_body(err.to_string()))?
                        .to_string();
                    if let Some(element) = current.as_mut() {
                        if in_state {
                            element.state = text;
                        } else if in_remote_identity {
                            element.remote_identity = Some(text);
                        }
                    }
                }
                Ok(Event::End(ref e)) => match e.name().as_ref() {
                    b"dialog" => {
                        if let Some(element) = current.take() {
                            document.dialogs.push(element);
                        }
                    }
                    b"state" => in_state = false,
                    b"remote" => in_remote = false,
                    b"identity" => in_remote_identity = false,
                    _ => {}
                },
                Ok(Event::Eof) => break,
                Err(e) => return Err(NotifierError::notify_body(e.to_string())),
                _ => {}
            }
            buf.clear();
        }

        Ok(document)
    }
}
