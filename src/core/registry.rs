//! Protocol registry and selection
//!
//! Directions are named from the caller's side of the link: an *upload*
//! moves a file from the remote user to us (we receive), a *download* moves
//! one to the user (we send).

use crate::core::external::ExternalProtocol;
use crate::core::protocol::FrameKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Keys never handed out to a protocol
pub const RESERVED_KEYS: [char; 2] = ['Q', '?'];

/// Keys tried, in order, once a protocol's own letter is taken
const FALLBACK_KEYS: &str = "1234567890!@#$%^&*()-=+<>";

/// Operation a protocol is being picked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferKind {
    /// Single file from the user
    Upload,
    /// Single file to the user
    Download,
    /// Single file from the user into the temporary area
    UploadTemp,
    /// Single file to the user from the temporary area
    DownloadTemp,
    /// Queued files from the user
    UploadBatch,
    /// Queued files to the user
    DownloadBatch,
    /// Queued files both ways in one session
    Bidirectional,
}

impl TransferKind {
    /// All operation kinds
    pub const ALL: [TransferKind; 7] = [
        TransferKind::Upload,
        TransferKind::Download,
        TransferKind::UploadTemp,
        TransferKind::DownloadTemp,
        TransferKind::UploadBatch,
        TransferKind::DownloadBatch,
        TransferKind::Bidirectional,
    ];

    /// Whether the operation moves a queue rather than one file
    pub fn is_batch(self) -> bool {
        matches!(
            self,
            TransferKind::UploadBatch | TransferKind::DownloadBatch | TransferKind::Bidirectional
        )
    }

    /// Whether a single file may be queued instead of moved now
    pub fn offers_queueing(self) -> bool {
        matches!(self, TransferKind::Upload | TransferKind::Download)
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferKind::Upload => "upload",
            TransferKind::Download => "download",
            TransferKind::UploadTemp => "upload-temp",
            TransferKind::DownloadTemp => "download-temp",
            TransferKind::UploadBatch => "upload-batch",
            TransferKind::DownloadBatch => "download-batch",
            TransferKind::Bidirectional => "bidirectional",
        };
        f.write_str(name)
    }
}

/// Protocol identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolId {
    /// 128-byte blocks, checksum preferred
    Xmodem,
    /// 128-byte blocks, CRC preferred
    XmodemCrc,
    /// 1024-byte blocks, CRC preferred
    Xmodem1K,
    /// Batch of 1024-byte blocks with file headers
    Ymodem,
    /// Delegated to the configured ZMODEM engine
    Zmodem,
    /// Queue the file instead of moving it now
    Batch,
    /// Configured external protocol, by position in the configuration
    External(usize),
}

impl ProtocolId {
    /// Block size and CRC preference of a native protocol
    pub fn native_framing(self) -> Option<(FrameKind, bool)> {
        match self {
            ProtocolId::Xmodem => Some((FrameKind::Short, false)),
            ProtocolId::XmodemCrc => Some((FrameKind::Short, true)),
            ProtocolId::Xmodem1K | ProtocolId::Ymodem => Some((FrameKind::Long, true)),
            _ => None,
        }
    }
}

/// What a protocol can do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// One file from the user
    pub receive: bool,
    /// One file to the user
    pub send: bool,
    /// Queued files from the user
    pub receive_batch: bool,
    /// Queued files to the user
    pub send_batch: bool,
    /// Both directions at once
    pub bidirectional: bool,
}

impl Capabilities {
    const SINGLE: Self = Self {
        receive: true,
        send: true,
        receive_batch: false,
        send_batch: false,
        bidirectional: false,
    };

    /// Derive capabilities from the command templates a protocol defines
    pub fn from_templates(protocol: &ExternalProtocol) -> Self {
        Self {
            receive: protocol.receive.is_some(),
            send: protocol.send.is_some(),
            receive_batch: protocol.receive_batch.is_some(),
            send_batch: protocol.send_batch.is_some(),
            bidirectional: protocol.bidirectional.is_some(),
        }
    }

    /// Whether the protocol can serve `kind`
    pub fn supports(&self, kind: TransferKind) -> bool {
        match kind {
            TransferKind::Upload | TransferKind::UploadTemp => self.receive,
            TransferKind::Download | TransferKind::DownloadTemp => self.send,
            TransferKind::UploadBatch => self.receive_batch,
            TransferKind::DownloadBatch => self.send_batch,
            TransferKind::Bidirectional => self.bidirectional,
        }
    }
}

/// One registered protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolDescriptor {
    /// Identifier
    pub id: ProtocolId,
    /// Display name
    pub name: String,
    /// Capability flags
    pub capabilities: Capabilities,
    /// Implemented in this crate rather than by another program
    pub internal: bool,
}

/// A protocol offered in one listing, with its key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolChoice {
    /// Key that selects it
    pub key: char,
    /// Identifier
    pub id: ProtocolId,
    /// Display name
    pub name: String,
}

/// Every protocol usable on this system
#[derive(Debug, Clone)]
pub struct ProtocolRegistry {
    descriptors: Vec<ProtocolDescriptor>,
}

impl ProtocolRegistry {
    /// Register the native protocols, ZMODEM when an engine is configured,
    /// and the configured external protocols
    pub fn new(zmodem: Option<&ExternalProtocol>, external: &[ExternalProtocol]) -> Self {
        let native = |id, name: &str, capabilities| ProtocolDescriptor {
            id,
            name: name.to_string(),
            capabilities,
            internal: true,
        };

        let mut descriptors = vec![
            native(ProtocolId::Xmodem, "XMODEM", Capabilities::SINGLE),
            native(ProtocolId::XmodemCrc, "XMODEM-CRC", Capabilities::SINGLE),
            native(ProtocolId::Xmodem1K, "XMODEM-1K", Capabilities::SINGLE),
            native(
                ProtocolId::Ymodem,
                "YMODEM",
                Capabilities {
                    receive_batch: true,
                    send_batch: true,
                    ..Capabilities::SINGLE
                },
            ),
        ];

        if let Some(engine) = zmodem {
            descriptors.push(native(
                ProtocolId::Zmodem,
                "ZMODEM",
                Capabilities::from_templates(engine),
            ));
        }

        descriptors.extend(external.iter().enumerate().map(|(i, p)| ProtocolDescriptor {
            id: ProtocolId::External(i),
            name: p.name.clone(),
            capabilities: Capabilities::from_templates(p),
            internal: false,
        }));

        Self { descriptors }
    }

    /// All registered protocols
    pub fn descriptors(&self) -> &[ProtocolDescriptor] {
        &self.descriptors
    }

    /// Look up one protocol
    pub fn descriptor(&self, id: ProtocolId) -> Option<&ProtocolDescriptor> {
        self.descriptors.iter().find(|d| d.id == id)
    }

    /// Look up a protocol by display name, ignoring case
    pub fn find_by_name(&self, name: &str) -> Option<&ProtocolDescriptor> {
        self.descriptors
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
    }

    /// Protocols usable for `kind`, in registration order
    pub fn available(&self, kind: TransferKind) -> Vec<&ProtocolDescriptor> {
        self.descriptors
            .iter()
            .filter(|d| d.capabilities.supports(kind))
            .collect()
    }

    /// Listing for `kind` with a unique key per entry
    ///
    /// Single up/downloads lead with the `Batch` entry that queues the file.
    pub fn listing(&self, kind: TransferKind) -> Vec<ProtocolChoice> {
        let mut entries: Vec<(ProtocolId, &str)> = Vec::new();
        if kind.offers_queueing() {
            entries.push((ProtocolId::Batch, "Batch"));
        }
        entries.extend(self.available(kind).into_iter().map(|d| (d.id, d.name.as_str())));

        let keys = assign_keys(entries.iter().map(|(_, name)| *name));
        entries
            .into_iter()
            .zip(keys)
            .filter_map(|((id, name), key)| match key {
                Some(key) => Some(ProtocolChoice {
                    key,
                    id,
                    name: name.to_string(),
                }),
                None => {
                    tracing::warn!(protocol = name, kind = %kind, "No key left, protocol not listed");
                    None
                }
            })
            .collect()
    }
}

/// Give each name its upper-cased first letter, or the next free fallback key
///
/// `None` once every fallback key is taken.
pub fn assign_keys<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<Option<char>> {
    let mut taken: Vec<char> = RESERVED_KEYS.to_vec();
    let mut keys = Vec::new();

    for name in names {
        let own = name
            .chars()
            .next()
            .map(|c| c.to_ascii_uppercase())
            .filter(|c| c.is_ascii_graphic() && !taken.contains(c));
        let key = own.or_else(|| FALLBACK_KEYS.chars().find(|c| !taken.contains(c)));
        taken.extend(key);
        keys.push(key);
    }
    keys
}

/// Key pressed at the protocol prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPress {
    /// Take the default
    Enter,
    /// Any other key
    Char(char),
}

/// Outcome of one key press
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// A protocol was picked
    Chosen(ProtocolId),
    /// 'Q': leave without transferring
    Quit,
    /// '?': show the listing again
    Help,
    /// Key maps to nothing, or Enter with no usable default
    Invalid,
}

/// Remembers the caller's protocol choices
#[derive(Debug, Clone, Default)]
pub struct ProtocolSelector {
    default: Option<ProtocolId>,
    last: Option<ProtocolId>,
    default_changed: bool,
}

impl ProtocolSelector {
    /// Start from the caller's stored default
    pub fn new(default: Option<ProtocolId>) -> Self {
        Self {
            default,
            last: None,
            default_changed: false,
        }
    }

    /// Stored default
    pub fn default_protocol(&self) -> Option<ProtocolId> {
        self.default
    }

    /// Most recent choice this session
    pub fn last(&self) -> Option<ProtocolId> {
        self.last
    }

    /// Whether a first explicit choice became the new default and should
    /// be persisted
    pub fn default_changed(&self) -> bool {
        self.default_changed
    }

    /// What Enter would pick from `listing`
    pub fn enter_choice(&self, listing: &[ProtocolChoice]) -> Option<ProtocolId> {
        [self.last, self.default]
            .into_iter()
            .flatten()
            .find(|id| listing.iter().any(|c| c.id == *id))
    }

    /// Resolve a key press against a listing
    pub fn select(&mut self, listing: &[ProtocolChoice], key: KeyPress) -> Selection {
        let id = match key {
            KeyPress::Enter => match self.enter_choice(listing) {
                Some(id) => id,
                None => return Selection::Invalid,
            },
            KeyPress::Char(c) => {
                let c = c.to_ascii_uppercase();
                match c {
                    'Q' => return Selection::Quit,
                    '?' => return Selection::Help,
                    _ => {}
                }
                match listing.iter().find(|choice| choice.key == c) {
                    Some(choice) => choice.id,
                    None => return Selection::Invalid,
                }
            }
        };

        self.last = Some(id);
        // Queueing is not a transfer protocol; never make it the default
        if self.default.is_none() && id != ProtocolId::Batch {
            tracing::debug!("New default protocol {:?}", id);
            self.default = Some(id);
            self.default_changed = true;
        }
        Selection::Chosen(id)
    }
}
