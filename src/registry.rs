use std::{cell::RefCell, rc::Rc};

use crate::{
    bus::IoBus,
    card::{Card, CardType, EmptyCard, PlaceholderCard},
    config::ConfigStore,
    frontend::Frontend,
    harddisk::HarddiskController,
    image::ImageCodec,
    memory::Memory,
    snapshot::{Snapshot, SnapshotError},
};

pub const NUM_SLOTS: usize = 8;
/// Index used for the auxiliary slot in configuration and snapshots.
pub const SLOT_AUX: u8 = 8;

/// The collaborators a card may need, passed explicitly instead of living
/// in globals. Cloning clones the handles, not the collaborators.
#[derive(Clone)]
pub struct HostContext {
    /// I/O dispatch; absent means cards skip handler registration.
    pub bus: Option<Rc<RefCell<IoBus>>>,
    pub memory: Rc<RefCell<Memory>>,
    pub codec: Rc<dyn ImageCodec>,
    pub config: Rc<RefCell<dyn ConfigStore>>,
    pub frontend: Rc<dyn Frontend>,
}

/// Owns one card per numbered slot plus the auxiliary slot. A slot is
/// never without an occupant; "nothing there" is the sentinel card.
pub struct SlotRegistry {
    ctx: HostContext,
    slots: [Card; NUM_SLOTS],
    aux: Card,
}

impl SlotRegistry {
    pub fn new(ctx: HostContext) -> Self {
        SlotRegistry {
            ctx,
            slots: std::array::from_fn(|_| Card::Empty(EmptyCard)),
            aux: Card::Empty(EmptyCard),
        }
    }

    pub fn context(&self) -> &HostContext {
        &self.ctx
    }

    pub fn card(&self, slot: usize) -> &Card {
        &self.slots[slot]
    }

    pub fn card_type(&self, slot: usize) -> CardType {
        self.slots[slot].card_type()
    }

    pub fn aux_type(&self) -> CardType {
        self.aux.card_type()
    }

    /// Typed accessor for a slot's storage controller, if that is what
    /// occupies it.
    pub fn harddisk(&self, slot: usize) -> Option<Rc<RefCell<HarddiskController>>> {
        match &self.slots[slot] {
            Card::HardDisk(ctrl) => Some(Rc::clone(ctrl)),
            _ => None,
        }
    }

    pub fn insert(&mut self, slot: usize, ty: CardType) {
        self.insert_with(slot, ty, true);
    }

    /// Replace `slot`'s occupant with a new `ty` instance. The previous
    /// occupant is destroyed first. Refused constructions leave the
    /// sentinel occupant in place. `update_config = false` suppresses
    /// persistence (bulk restore must not touch the store).
    pub fn insert_with(&mut self, slot: usize, ty: CardType, update_config: bool) {
        self.teardown(slot);

        let card = match self.construct(slot as u8, ty) {
            Some(card) => card,
            None => Card::Empty(EmptyCard),
        };
        tracing::info!("[SLOTS] slot {} now holds {}", slot, card.card_type());
        self.slots[slot] = card;

        if update_config {
            let actual = self.slots[slot].card_type();
            self.ctx
                .config
                .borrow_mut()
                .set_slot_type(slot as u8, actual);
        }
    }

    pub fn remove(&mut self, slot: usize) {
        self.insert(slot, CardType::Empty);
    }

    pub fn insert_aux(&mut self, ty: CardType) {
        self.insert_aux_with(ty, true);
    }

    pub fn insert_aux_with(&mut self, ty: CardType, update_config: bool) {
        let card = match ty {
            CardType::Empty => Card::Empty(EmptyCard),
            ty if ty.is_aux() => Card::Placeholder(PlaceholderCard::new(ty, SLOT_AUX)),
            ty => {
                tracing::error!("[SLOTS] {} refused for the auxiliary slot", ty);
                Card::Empty(EmptyCard)
            }
        };
        tracing::info!("[SLOTS] auxiliary slot now holds {}", card.card_type());
        self.aux = card;

        if update_config {
            let actual = self.aux.card_type();
            self.ctx.config.borrow_mut().set_slot_type(SLOT_AUX, actual);
        }
    }

    pub fn remove_aux(&mut self) {
        self.insert_aux(CardType::Empty);
    }

    /// Populate every slot from the configuration store, persistence
    /// suppressed, then re-mount any recorded images.
    pub fn load_config(&mut self) {
        for slot in 0..NUM_SLOTS {
            let ty = self.ctx.config.borrow().slot_type(slot as u8);
            self.insert_with(slot, ty, false);
            if let Some(ctrl) = self.harddisk(slot) {
                ctrl.borrow_mut().load_last_images();
            }
        }
        let aux = self.ctx.config.borrow().slot_type(SLOT_AUX);
        self.insert_aux_with(aux, false);
    }

    pub fn init_all(&mut self) {
        for slot in 0..NUM_SLOTS {
            self.slots[slot].init();
        }
        self.aux.init();
    }

    pub fn reset_all(&mut self, power_cycle: bool) {
        for slot in 0..NUM_SLOTS {
            self.slots[slot].reset(power_cycle);
        }
        self.aux.reset(power_cycle);
    }

    /// Collect the snapshot sections of every participating card.
    pub fn save_snapshot(&self, pc: u16) -> Result<Snapshot, SnapshotError> {
        let mut cards = Vec::new();
        for slot in 0..NUM_SLOTS {
            if let Card::HardDisk(ctrl) = &self.slots[slot] {
                cards.push(ctrl.borrow().save_section()?);
            }
        }
        Ok(Snapshot { pc, cards })
    }

    /// Restore every section: re-insert the card (configuration untouched)
    /// and hand it its state. Any section error aborts the whole load.
    pub fn load_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        for section in &snapshot.cards {
            let ty = CardType::from_section_name(&section.card)
                .ok_or_else(|| SnapshotError::UnknownCard(section.card.clone()))?;
            let slot = section.slot as usize;
            if slot >= NUM_SLOTS {
                return Err(SnapshotError::WrongSlot {
                    card: section.card.clone(),
                    slot: section.slot,
                });
            }
            self.insert_with(slot, ty, false);
            match &self.slots[slot] {
                Card::HardDisk(ctrl) => ctrl.borrow_mut().load_section(section, snapshot.pc)?,
                _ => {
                    return Err(SnapshotError::WrongSlot {
                        card: section.card.clone(),
                        slot: section.slot,
                    })
                }
            }
        }
        Ok(())
    }

    fn teardown(&mut self, slot: usize) {
        let previous = std::mem::replace(&mut self.slots[slot], Card::Empty(EmptyCard));
        if let Card::HardDisk(ctrl) = previous {
            ctrl.borrow_mut().destroy();
        }
    }

    /// Build an occupant for `ty`, or refuse (`None`) on a constraint
    /// violation. Kinds without a full implementation become placeholders
    /// so the configuration can still declare the hardware exists.
    fn construct(&self, slot: u8, ty: CardType) -> Option<Card> {
        if ty.is_singleton() && self.holds_type(ty) {
            tracing::error!(
                "[SLOTS] {} refused for slot {}: one instance already present",
                ty,
                slot
            );
            return None;
        }
        if ty.is_slot0_only() && slot != 0 {
            tracing::error!("[SLOTS] {} is slot-0 hardware, refused for slot {}", ty, slot);
            return None;
        }
        if ty.is_aux() {
            tracing::error!(
                "[SLOTS] {} belongs in the auxiliary slot, refused for slot {}",
                ty,
                slot
            );
            return None;
        }

        match ty {
            CardType::Empty => Some(Card::Empty(EmptyCard)),
            CardType::HardDisk => Some(Card::HardDisk(HarddiskController::new(
                slot,
                self.ctx.clone(),
            ))),
            ty => Some(Card::Placeholder(PlaceholderCard::new(ty, slot))),
        }
    }

    /// Whether any slot (auxiliary included) currently holds `ty`.
    fn holds_type(&self, ty: CardType) -> bool {
        self.slots.iter().any(|card| card.card_type() == ty) || self.aux.card_type() == ty
    }
}

impl Drop for SlotRegistry {
    fn drop(&mut self) {
        for slot in 0..NUM_SLOTS {
            self.teardown(slot);
        }
    }
}
