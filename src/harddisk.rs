// Block-storage interface card.
//
// Register window (low nibble of the address, r = read, w = write):
//
//   0x0  (r)   execute current command, return status
//   0x1  (r)   error code
//   0x2  (r/w) command (0=status, 1=read, 2=write, 3=format)
//   0x3  (r/w) unit selector (bit 7 = unit)
//   0x4  (r/w) memory pointer low byte
//   0x5  (r/w) memory pointer high byte
//   0x6  (r/w) disk block low byte
//   0x7  (r/w) disk block high byte
//   0x8  (r)   next transfer-buffer byte
//
// Executing a command is a side effect of reading port 0x0; host software
// depends on exactly that, so it is not an incidental quirk.

use std::{
    cell::RefCell,
    path::{Path, PathBuf},
    rc::Rc,
};

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::{
    bus::{io_fallback, IoHandler},
    card::{CardType, HARDDISK_SECTION_NAME},
    config::{slot_section, KEY_LAST_IMAGE},
    frontend::{DRAW_DISK_STATUS, DRAW_LEDS},
    image::{BlockImage, ImageError, BLOCK_SIZE},
    registry::HostContext,
    snapshot::{CardSection, SnapshotError},
};

pub const DEVICE_OK: u8 = 0x00;
pub const DEVICE_IO_ERROR: u8 = 0x27;
pub const DEVICE_UNKNOWN_ERROR: u8 = 0x28;

const CMD_STATUS: u8 = 0x00;
const CMD_READ: u8 = 0x01;
const CMD_WRITE: u8 = 0x02;
const CMD_FORMAT: u8 = 0x03;

pub const UNIT_1: usize = 0;
pub const UNIT_2: usize = 1;

// Section version history:
// 2: current firmware revision
const UNIT_VERSION: u32 = 2;
const MIN_UNIT_VERSION: u32 = 1;

/// Edge-latched drive activity state; the frontend is only notified when
/// the next value differs from the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DiskStatus {
    Off = 0,
    Read = 1,
    Write = 2,
    Prot = 3,
}

impl DiskStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => DiskStatus::Read,
            2 => DiskStatus::Write,
            3 => DiskStatus::Prot,
            _ => DiskStatus::Off,
        }
    }
}

/// One drive unit. The image handle is owned here exclusively; dropping
/// the record (or taking the option) closes it.
struct HardDrive {
    image: Option<Box<dyn BlockImage>>,
    write_protected: bool,
    imagename: String,
    fullname: String,
    disk_block: u32,
    mem_block: u16,
    error: u8,
    buf: [u8; BLOCK_SIZE],
    buf_ptr: usize,
    status_next: DiskStatus,
    status_prev: DiskStatus,
}

impl Default for HardDrive {
    fn default() -> Self {
        HardDrive {
            image: None,
            write_protected: false,
            imagename: String::new(),
            fullname: String::new(),
            disk_block: 0,
            mem_block: 0,
            error: 0,
            buf: [0; BLOCK_SIZE],
            buf_ptr: 0,
            status_next: DiskStatus::Off,
            status_prev: DiskStatus::Off,
        }
    }
}

pub struct HarddiskController {
    slot: u8,
    ctx: HostContext,
    // One command register for both units; host software writes the
    // command before switching units.
    command: u8,
    unit_num: u8,
    save_disk_image: bool,
    io_registered: bool,
    drives: [HardDrive; 2],
}

impl HarddiskController {
    pub fn new(slot: u8, ctx: HostContext) -> Rc<RefCell<Self>> {
        let ctrl = Rc::new(RefCell::new(HarddiskController {
            slot,
            ctx,
            command: 0,
            unit_num: 0,
            save_disk_image: true,
            io_registered: false,
            drives: [HardDrive::default(), HardDrive::default()],
        }));
        Self::attach(&ctrl);
        ctrl
    }

    /// Bind the controller into the I/O bus. Skipped when the bus or the
    /// firmware resource is unavailable; safe to call again later.
    pub fn attach(ctrl: &Rc<RefCell<Self>>) {
        let (slot, bus, registered) = {
            let c = ctrl.borrow();
            (c.slot, c.ctx.bus.clone(), c.io_registered)
        };
        if registered {
            return;
        }
        let Some(bus) = bus else { return };
        let firmware = ctrl.borrow().ctx.frontend.firmware(CardType::HardDisk);
        let Some(firmware) = firmware else { return };
        bus.borrow_mut()
            .register(slot, ctrl.clone(), Some(&firmware));
        ctrl.borrow_mut().io_registered = true;
    }

    pub fn reset(&mut self, _power_cycle: bool) {
        self.drives[UNIT_1].error = 0;
        self.drives[UNIT_2].error = 0;
    }

    /// Full teardown: release both image handles without persisting and
    /// leave no binding behind on the bus.
    pub fn destroy(&mut self) {
        self.save_disk_image = false;
        self.cleanup_drive(UNIT_1);
        self.cleanup_drive(UNIT_2);
        self.save_disk_image = true;

        if self.io_registered {
            if let Some(bus) = &self.ctx.bus {
                bus.borrow_mut().unregister(self.slot);
            }
            self.io_registered = false;
        }
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }

    pub fn is_unplugged(&self, unit: usize) -> bool {
        self.drives[unit].image.is_none()
    }

    pub fn image_name(&self, unit: usize) -> &str {
        &self.drives[unit].imagename
    }

    pub fn full_name(&self, unit: usize) -> &str {
        &self.drives[unit].fullname
    }

    pub fn image_path(&self, unit: usize) -> Option<&Path> {
        self.drives[unit].image.as_ref().map(|img| img.pathname())
    }

    pub fn write_protected(&self, unit: usize) -> bool {
        self.drives[unit].write_protected
    }

    /// Latched activity state of the active unit.
    pub fn light_status(&self) -> DiskStatus {
        self.drives[self.active_unit()].status_prev
    }

    fn active_unit(&self) -> usize {
        ((self.unit_num >> 7) & 1) as usize
    }

    //
    // Image lifecycle
    //

    pub fn insert(&mut self, unit: usize, path: impl AsRef<Path>) -> Result<(), ImageError> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(ImageError::Rejected("empty pathname".into()));
        }

        if self.drives[unit].image.is_some() {
            self.unplug(unit);
        }

        // A single backing image can never be mounted on both units; the
        // other unit gives it up first.
        let resolved = self.ctx.codec.resolve(path);
        let other = unit ^ 1;
        let other_path = self.drives[other]
            .image
            .as_ref()
            .map(|img| img.pathname().to_path_buf());
        if other_path.as_deref() == Some(resolved.as_path()) {
            self.unplug(other);
            self.ctx
                .frontend
                .refresh_status(DRAW_LEDS | DRAW_DISK_STATUS);
        }

        let result = self.ctx.codec.open(path, false, false);
        {
            let drive = &mut self.drives[unit];
            drive.status_next = DiskStatus::Off;
            drive.status_prev = DiskStatus::Off;
        }

        let outcome = match result {
            Ok(opened) => {
                let fullname = opened.image.pathname().display().to_string();
                let imagename = opened
                    .image
                    .pathname()
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                tracing::info!("[HDD] slot {} unit {} mounted {}", self.slot, unit + 1, fullname);

                let drive = &mut self.drives[unit];
                drive.write_protected = opened.write_protected;
                drive.imagename = imagename;
                drive.fullname = fullname;
                drive.image = Some(opened.image);

                self.ctx.frontend.paths_updated();
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    "[HDD] slot {} unit {} mount of {} failed: {}",
                    self.slot,
                    unit + 1,
                    path.display(),
                    err
                );
                Err(err)
            }
        };

        self.save_last_image(unit);
        outcome
    }

    pub fn unplug(&mut self, unit: usize) {
        if self.drives[unit].image.is_some() {
            self.cleanup_drive(unit);
            self.ctx.frontend.paths_updated();
        }
    }

    /// Exchange the two units' complete state in place, handles included.
    pub fn swap(&mut self) {
        self.drives.swap(UNIT_1, UNIT_2);

        self.save_last_image(UNIT_1);
        self.save_last_image(UNIT_2);

        self.ctx.frontend.refresh_status(DRAW_LEDS);
    }

    /// Ask the frontend for an image and mount it.
    pub fn select_image(&mut self, unit: usize) -> bool {
        let suggested = PathBuf::from(&self.drives[unit].fullname);
        let Some(chosen) = self.ctx.frontend.select_image(self.slot, unit, &suggested) else {
            return false;
        };
        match self.insert(unit, &chosen) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!("[HDD] selected image rejected: {}", err);
                self.ctx.frontend.invalid_image(&chosen);
                false
            }
        }
    }

    /// Re-mount both units from the configuration store, without writing
    /// the paths straight back.
    pub fn load_last_images(&mut self) {
        let section = slot_section(self.slot);
        for unit in [UNIT_1, UNIT_2] {
            let path = self
                .ctx
                .config
                .borrow()
                .load_string(&section, KEY_LAST_IMAGE[unit]);
            if let Some(path) = path.filter(|p| !p.is_empty()) {
                self.save_disk_image = false;
                if self.insert(unit, &path).is_err() {
                    tracing::warn!("[HDD] last image for unit {} unavailable: {}", unit + 1, path);
                }
                self.save_disk_image = true;
            }
        }
    }

    fn cleanup_drive_internal(&mut self, unit: usize) {
        let drive = &mut self.drives[unit];
        if drive.image.take().is_some() {
            tracing::info!("[HDD] slot {} unit {} unplugged", self.slot, unit + 1);
        }
        drive.write_protected = false;
        drive.imagename.clear();
        drive.fullname.clear();
    }

    fn cleanup_drive(&mut self, unit: usize) {
        self.cleanup_drive_internal(unit);
        self.save_last_image(unit);
    }

    fn save_last_image(&mut self, unit: usize) {
        if !self.save_disk_image {
            return;
        }
        let section = slot_section(self.slot);
        let mut config = self.ctx.config.borrow_mut();
        config.set_slot_type(self.slot, CardType::HardDisk);
        config.save_string(&section, KEY_LAST_IMAGE[unit], &self.drives[unit].fullname);
    }

    //
    // Command engine
    //

    fn execute(&mut self, unit: usize) -> u8 {
        if self.drives[unit].image.is_none() {
            let drive = &mut self.drives[unit];
            drive.status_next = DiskStatus::Off;
            drive.error = 1;
            return DEVICE_UNKNOWN_ERROR;
        }
        match self.command {
            CMD_STATUS => self.cmd_status(unit),
            CMD_READ => self.cmd_read(unit),
            CMD_WRITE => self.cmd_write(unit),
            CMD_FORMAT => {
                self.drives[unit].status_next = DiskStatus::Write;
                DEVICE_OK
            }
            // Unrecognized commands report status as well.
            _ => self.cmd_status(unit),
        }
    }

    fn cmd_status(&mut self, unit: usize) -> u8 {
        let drive = &mut self.drives[unit];
        let size = drive.image.as_ref().map_or(0, |img| img.size());
        if size == 0 {
            // Nothing usable is mounted.
            drive.error = 1;
            DEVICE_IO_ERROR
        } else {
            DEVICE_OK
        }
    }

    fn cmd_read(&mut self, unit: usize) -> u8 {
        let drive = &mut self.drives[unit];
        let Some(img) = drive.image.as_mut() else {
            return DEVICE_UNKNOWN_ERROR;
        };
        if (drive.disk_block as u64) * BLOCK_SIZE as u64 >= img.size() {
            drive.error = 1;
            return DEVICE_IO_ERROR;
        }
        match img.read_block(drive.disk_block, &mut drive.buf) {
            Ok(()) => {
                drive.error = 0;
                drive.buf_ptr = 0;
                DEVICE_OK
            }
            Err(err) => {
                tracing::warn!("[HDD] block {} read failed: {}", drive.disk_block, err);
                drive.error = 1;
                DEVICE_IO_ERROR
            }
        }
    }

    fn cmd_write(&mut self, unit: usize) -> u8 {
        let memory = Rc::clone(&self.ctx.memory);
        let drive = &mut self.drives[unit];
        drive.status_next = DiskStatus::Write;
        let Some(img) = drive.image.as_mut() else {
            return DEVICE_UNKNOWN_ERROR;
        };

        let mut ok = true;

        // A target beyond the current extent grows the image with
        // zero-filled blocks up to (not including) the target. The image
        // is never shrunk anywhere.
        if (drive.disk_block as u64) * BLOCK_SIZE as u64 >= img.size() {
            drive.buf = [0; BLOCK_SIZE];
            let mut block = (img.size() / BLOCK_SIZE as u64) as u32;
            while block < drive.disk_block {
                if let Err(err) = img.write_block(block, &drive.buf) {
                    tracing::warn!("[HDD] growing image failed at block {}: {}", block, err);
                    ok = false;
                    break;
                }
                block += 1;
            }
        }

        {
            let memory = memory.borrow();
            for (i, byte) in drive.buf.iter_mut().enumerate() {
                *byte = memory.read_byte(drive.mem_block.wrapping_add(i as u16));
            }
        }

        if ok {
            ok = match img.write_block(drive.disk_block, &drive.buf) {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!("[HDD] block {} write failed: {}", drive.disk_block, err);
                    false
                }
            };
        }

        if ok {
            drive.error = 0;
            DEVICE_OK
        } else {
            drive.error = 1;
            DEVICE_IO_ERROR
        }
    }

    fn update_light(&mut self, unit: usize) {
        let drive = &mut self.drives[unit];
        if drive.status_prev != drive.status_next {
            drive.status_prev = drive.status_next;
            self.ctx
                .frontend
                .refresh_status(DRAW_LEDS | DRAW_DISK_STATUS);
        }
    }

    //
    // Snapshot
    //

    pub fn save_section(&self) -> Result<CardSection, SnapshotError> {
        let state = ControllerState {
            current_unit: self.unit_num,
            command: self.command,
            unit0: self.unit_state(UNIT_1),
            unit1: self.unit_state(UNIT_2),
        };
        Ok(CardSection {
            card: HARDDISK_SECTION_NAME.to_string(),
            slot: self.slot,
            version: UNIT_VERSION,
            state: serde_json::to_value(&state)?,
        })
    }

    pub fn load_section(&mut self, section: &CardSection, pc: u16) -> Result<(), SnapshotError> {
        if section.slot != self.slot {
            return Err(SnapshotError::WrongSlot {
                card: section.card.clone(),
                slot: section.slot,
            });
        }
        if section.version < MIN_UNIT_VERSION || section.version > UNIT_VERSION {
            return Err(SnapshotError::UnsupportedVersion {
                card: section.card.clone(),
                version: section.version,
            });
        }
        // A version-1 section predates the current firmware revision;
        // resuming with the CPU inside this slot's firmware page would
        // execute stale code.
        if section.version == 1 && (pc >> 8) == (0x00C0 | self.slot as u16) {
            return Err(SnapshotError::StaleFirmware {
                slot: self.slot,
                pc,
            });
        }

        let state: ControllerState = serde_json::from_value(section.state.clone())?;
        self.unit_num = state.current_unit;
        self.command = state.command;

        // Unplug both first in case unit 2's old image is to be re-mounted
        // as unit 1.
        for unit in [UNIT_1, UNIT_2] {
            self.unplug(unit);
            self.drives[unit] = HardDrive::default();
        }

        self.load_unit(UNIT_1, &state.unit0);
        self.load_unit(UNIT_2, &state.unit1);
        Ok(())
    }

    fn unit_state(&self, unit: usize) -> UnitState {
        let drive = &self.drives[unit];
        UnitState {
            filename: drive.fullname.clone(),
            error: drive.error,
            mem_block: drive.mem_block,
            disk_block: drive.disk_block,
            image_loaded: drive.image.is_some(),
            status_next: drive.status_next as u8,
            status_prev: drive.status_prev as u8,
            buffer_offset: drive.buf_ptr as u16,
            buffer: drive.buf,
        }
    }

    fn load_unit(&mut self, unit: usize, state: &UnitState) {
        tracing::trace!(
            "[HDD] restoring unit {}: was loaded = {}",
            unit + 1,
            state.image_loaded
        );
        {
            let drive = &mut self.drives[unit];
            drive.error = state.error;
            drive.mem_block = state.mem_block;
            drive.disk_block = state.disk_block;
            drive.buf = state.buffer;
            drive.buf_ptr = (state.buffer_offset as usize).min(BLOCK_SIZE - 1);
        }

        if !state.filename.is_empty() {
            let path = PathBuf::from(&state.filename);
            let mounted = match self.insert(unit, &path) {
                Ok(()) => true,
                Err(ImageError::NotFound(_)) => {
                    // Image moved since the snapshot; ask the frontend to
                    // relocate it. Best-effort per unit.
                    let chosen = self.ctx.frontend.select_image(self.slot, unit, &path);
                    match chosen {
                        Some(chosen) => match self.insert(unit, &chosen) {
                            Ok(()) => true,
                            Err(_) => {
                                self.ctx.frontend.invalid_image(&chosen);
                                false
                            }
                        },
                        None => false,
                    }
                }
                Err(_) => false,
            };
            if !mounted {
                tracing::warn!(
                    "[HDD] slot {} unit {} left unloaded: {}",
                    self.slot,
                    unit + 1,
                    state.filename
                );
            }
        }

        let drive = &mut self.drives[unit];
        drive.status_next = DiskStatus::from_u8(state.status_next);
        drive.status_prev = DiskStatus::from_u8(state.status_prev);
    }
}

impl IoHandler for HarddiskController {
    fn io_read(&mut self, pc: u16, addr: u16, cycles: u32) -> u8 {
        let unit = self.active_unit();
        self.drives[unit].status_next = DiskStatus::Read;

        let r = match addr & 0xF {
            0x0 => self.execute(unit),
            0x1 => {
                let drive = &mut self.drives[unit];
                drive.status_next = DiskStatus::Off;
                if drive.error != 0 {
                    // Firmware requires b0 = 1 for an error.
                    drive.error |= 1;
                }
                drive.error
            }
            0x2 => self.command,
            0x3 => self.unit_num,
            0x4 => (self.drives[unit].mem_block & 0x00FF) as u8,
            0x5 => ((self.drives[unit].mem_block & 0xFF00) >> 8) as u8,
            0x6 => (self.drives[unit].disk_block & 0x00FF) as u8,
            0x7 => ((self.drives[unit].disk_block & 0xFF00) >> 8) as u8,
            0x8 => {
                let drive = &mut self.drives[unit];
                let byte = drive.buf[drive.buf_ptr];
                if drive.buf_ptr < BLOCK_SIZE - 1 {
                    drive.buf_ptr += 1;
                }
                byte
            }
            _ => {
                self.drives[unit].status_next = DiskStatus::Off;
                io_fallback(pc, addr, false, 0, cycles)
            }
        };

        self.update_light(unit);
        r
    }

    fn io_write(&mut self, pc: u16, addr: u16, value: u8, cycles: u32) -> u8 {
        let unit = self.active_unit();
        self.drives[unit].status_next = DiskStatus::Prot;

        let mut r = DEVICE_OK;
        match addr & 0xF {
            0x2 => self.command = value,
            0x3 => {
                // b7 = unit, b6..4 = slot, b3..0 unused
                self.unit_num = value;
            }
            0x4 => {
                let drive = &mut self.drives[unit];
                drive.mem_block = (drive.mem_block & 0xFF00) | value as u16;
            }
            0x5 => {
                let drive = &mut self.drives[unit];
                drive.mem_block = (drive.mem_block & 0x00FF) | ((value as u16) << 8);
            }
            0x6 => {
                let drive = &mut self.drives[unit];
                drive.disk_block = (drive.disk_block & 0xFF00) | value as u32;
            }
            0x7 => {
                let drive = &mut self.drives[unit];
                drive.disk_block = (drive.disk_block & 0x00FF) | ((value as u32) << 8);
            }
            _ => {
                self.drives[unit].status_next = DiskStatus::Off;
                r = io_fallback(pc, addr, true, value, cycles);
            }
        }

        self.update_light(unit);
        r
    }
}

#[derive(Serialize, Deserialize)]
struct ControllerState {
    #[serde(rename = "CurrentUnit")]
    current_unit: u8,
    #[serde(rename = "Command")]
    command: u8,
    #[serde(rename = "Unit0")]
    unit0: UnitState,
    #[serde(rename = "Unit1")]
    unit1: UnitState,
}

#[derive(Serialize, Deserialize)]
struct UnitState {
    #[serde(rename = "Filename")]
    filename: String,
    #[serde(rename = "Error")]
    error: u8,
    #[serde(rename = "MemBlock")]
    mem_block: u16,
    #[serde(rename = "DiskBlock")]
    disk_block: u32,
    #[serde(rename = "ImageLoaded")]
    image_loaded: bool,
    #[serde(rename = "StatusNext")]
    status_next: u8,
    #[serde(rename = "StatusPrev")]
    status_prev: u8,
    #[serde(rename = "BufferOffset")]
    buffer_offset: u16,
    #[serde(rename = "Buffer", with = "BigArray")]
    buffer: [u8; BLOCK_SIZE],
}
