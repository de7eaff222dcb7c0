// Versioned state capture. Each participating card contributes one named
// section; the registry stitches them into a whole-machine snapshot.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("unsupported {card} section version {version}")]
    UnsupportedVersion { card: String, version: u32 },
    #[error("{card} section bound to wrong slot {slot}")]
    WrongSlot { card: String, slot: u8 },
    #[error("unknown card section: {0}")]
    UnknownCard(String),
    #[error("cpu at {pc:#06X} is executing obsolete slot {slot} firmware")]
    StaleFirmware { slot: u8, pc: u16 },
    #[error("malformed section state: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One card's captured state: name tag, slot binding, section version and
/// the versioned payload itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardSection {
    pub card: String,
    pub slot: u8,
    pub version: u32,
    pub state: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Saved CPU program counter; consulted by stale-firmware guards.
    pub pc: u16,
    pub cards: Vec<CardSection>,
}

impl Snapshot {
    pub fn to_json(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_str(text)?)
    }

    /// The section for `card_name` at `slot`, if present.
    pub fn section(&self, card_name: &str, slot: u8) -> Option<&CardSection> {
        self.cards
            .iter()
            .find(|section| section.card == card_name && section.slot == slot)
    }
}
