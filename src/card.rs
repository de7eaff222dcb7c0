use std::{cell::RefCell, fmt, rc::Rc};

use serde::{Deserialize, Serialize};

use crate::harddisk::HarddiskController;

pub(crate) const HARDDISK_SECTION_NAME: &str = "Block Storage";

/// Every peripheral kind the machine knows about. Closed set: the slot
/// registry only ever constructs occupants for these tags.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum CardType {
    Empty,
    DiskInterface,
    SerialCard,
    SoundCard,
    Printer,
    HardDisk,
    Clock,
    MouseCard,
    LanguageCard,
    Saturn128,
    EightyColumn,
    ExtendedEightyColumn,
    RamExpansion,
}

impl CardType {
    /// Kinds that may exist at most once across all slots.
    pub fn is_singleton(self) -> bool {
        matches!(self, CardType::SerialCard | CardType::MouseCard)
    }

    /// Kinds hard-wired to slot 0.
    pub fn is_slot0_only(self) -> bool {
        matches!(self, CardType::LanguageCard | CardType::Saturn128)
    }

    /// Memory-expansion kinds that go in the auxiliary slot, never a
    /// numbered one.
    pub fn is_aux(self) -> bool {
        matches!(
            self,
            CardType::EightyColumn | CardType::ExtendedEightyColumn | CardType::RamExpansion
        )
    }

    /// Snapshot section tag for kinds that participate in state capture.
    pub fn section_name(self) -> Option<&'static str> {
        match self {
            CardType::HardDisk => Some(HARDDISK_SECTION_NAME),
            _ => None,
        }
    }

    pub fn from_section_name(name: &str) -> Option<CardType> {
        match name {
            HARDDISK_SECTION_NAME => Some(CardType::HardDisk),
            _ => None,
        }
    }
}

impl fmt::Display for CardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Sentinel occupant for an unconfigured slot.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyCard;

/// Occupant for a kind the system declares but does not implement yet.
/// Satisfies the card contract with no-op behavior.
#[derive(Debug, Clone, Copy)]
pub struct PlaceholderCard {
    ty: CardType,
    slot: u8,
}

impl PlaceholderCard {
    pub fn new(ty: CardType, slot: u8) -> Self {
        PlaceholderCard { ty, slot }
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }
}

/// A slot occupant. Slots always hold one of these; absence is the
/// `Empty` variant, never a missing value.
pub enum Card {
    Empty(EmptyCard),
    Placeholder(PlaceholderCard),
    HardDisk(Rc<RefCell<HarddiskController>>),
}

impl Card {
    pub fn init(&mut self) {
        match self {
            Card::Empty(_) | Card::Placeholder(_) => {}
            Card::HardDisk(ctrl) => HarddiskController::attach(ctrl),
        }
    }

    pub fn reset(&mut self, power_cycle: bool) {
        match self {
            Card::Empty(_) | Card::Placeholder(_) => {}
            Card::HardDisk(ctrl) => ctrl.borrow_mut().reset(power_cycle),
        }
    }

    pub fn card_type(&self) -> CardType {
        match self {
            Card::Empty(_) => CardType::Empty,
            Card::Placeholder(card) => card.ty,
            Card::HardDisk(_) => CardType::HardDisk,
        }
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.card_type())
    }
}
