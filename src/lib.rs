pub mod bus;
pub mod card;
pub mod config;
pub mod frontend;
pub mod harddisk;
pub mod image;
pub mod memory;
pub mod registry;
pub mod snapshot;

pub use bus::{io_fallback, IoBus, IoHandler, IO_BASE, SLOT_FW_SIZE};
pub use card::{Card, CardType, EmptyCard, PlaceholderCard};
pub use config::{slot_section, ConfigStore, KEY_LAST_IMAGE};
pub use frontend::{Frontend, NullFrontend, DRAW_DISK_STATUS, DRAW_LEDS};
pub use harddisk::{
    DiskStatus, HarddiskController, DEVICE_IO_ERROR, DEVICE_OK, DEVICE_UNKNOWN_ERROR, UNIT_1,
    UNIT_2,
};
pub use image::{BlockImage, ImageCodec, ImageError, OpenedImage, BLOCK_SIZE};
pub use memory::{Memory, MEM_SIZE};
pub use registry::{HostContext, SlotRegistry, NUM_SLOTS, SLOT_AUX};
pub use snapshot::{CardSection, Snapshot, SnapshotError};
