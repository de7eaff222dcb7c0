// In-memory collaborators shared by the integration tests.
#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    path::{Path, PathBuf},
    rc::Rc,
};

use a2bus::{
    BlockImage, CardType, ConfigStore, Frontend, HostContext, ImageCodec, ImageError, IoBus,
    Memory, OpenedImage, SlotRegistry, BLOCK_SIZE,
};

#[ctor::ctor]
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Image codec over a shared path -> bytes map. Writes past the end of a
/// disk extend it, the way seek-and-write extends a real file.
#[derive(Default)]
pub struct MemCodec {
    disks: Rc<RefCell<HashMap<PathBuf, Vec<u8>>>>,
}

impl MemCodec {
    pub fn add_disk(&self, path: impl Into<PathBuf>, bytes: Vec<u8>) {
        self.disks.borrow_mut().insert(path.into(), bytes);
    }

    pub fn remove_disk(&self, path: impl AsRef<Path>) {
        self.disks.borrow_mut().remove(path.as_ref());
    }

    pub fn disk(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.disks.borrow().get(path.as_ref()).cloned()
    }
}

impl ImageCodec for MemCodec {
    fn open(
        &self,
        path: &Path,
        _create_if_missing: bool,
        _expect_floppy: bool,
    ) -> Result<OpenedImage, ImageError> {
        if !self.disks.borrow().contains_key(path) {
            return Err(ImageError::NotFound(path.to_path_buf()));
        }
        Ok(OpenedImage {
            image: Box::new(MemImage {
                disks: Rc::clone(&self.disks),
                path: path.to_path_buf(),
            }),
            write_protected: false,
        })
    }
}

struct MemImage {
    disks: Rc<RefCell<HashMap<PathBuf, Vec<u8>>>>,
    path: PathBuf,
}

impl BlockImage for MemImage {
    fn read_block(&mut self, block: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), ImageError> {
        let disks = self.disks.borrow();
        let data = disks
            .get(&self.path)
            .ok_or_else(|| ImageError::Io(format!("{} vanished", self.path.display())))?;
        let start = block as usize * BLOCK_SIZE;
        if start + BLOCK_SIZE > data.len() {
            return Err(ImageError::Io(format!(
                "read past end of {}",
                self.path.display()
            )));
        }
        buf.copy_from_slice(&data[start..start + BLOCK_SIZE]);
        Ok(())
    }

    fn write_block(&mut self, block: u32, buf: &[u8; BLOCK_SIZE]) -> Result<(), ImageError> {
        let mut disks = self.disks.borrow_mut();
        let data = disks
            .get_mut(&self.path)
            .ok_or_else(|| ImageError::Io(format!("{} vanished", self.path.display())))?;
        let start = block as usize * BLOCK_SIZE;
        if data.len() < start + BLOCK_SIZE {
            data.resize(start + BLOCK_SIZE, 0);
        }
        data[start..start + BLOCK_SIZE].copy_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.disks.borrow().get(&self.path).map_or(0, |d| d.len() as u64)
    }

    fn pathname(&self) -> &Path {
        &self.path
    }
}

#[derive(Default)]
pub struct MemConfig {
    pub types: HashMap<u8, CardType>,
    pub strings: HashMap<(String, String), String>,
}

impl ConfigStore for MemConfig {
    fn slot_type(&self, slot: u8) -> CardType {
        self.types.get(&slot).copied().unwrap_or(CardType::Empty)
    }

    fn set_slot_type(&mut self, slot: u8, ty: CardType) {
        self.types.insert(slot, ty);
    }

    fn load_string(&self, section: &str, key: &str) -> Option<String> {
        self.strings
            .get(&(section.to_string(), key.to_string()))
            .cloned()
    }

    fn save_string(&mut self, section: &str, key: &str, value: &str) {
        self.strings
            .insert((section.to_string(), key.to_string()), value.to_string());
    }
}

/// Frontend that records every notification and answers the image chooser
/// with a scripted response.
#[derive(Default)]
pub struct TestFrontend {
    pub refreshes: RefCell<Vec<u8>>,
    pub select_response: RefCell<Option<PathBuf>>,
    pub selects: RefCell<Vec<PathBuf>>,
    pub path_updates: Cell<usize>,
    pub invalid: RefCell<Vec<PathBuf>>,
}

impl Frontend for TestFrontend {
    fn refresh_status(&self, flags: u8) {
        self.refreshes.borrow_mut().push(flags);
    }

    fn firmware(&self, _card: CardType) -> Option<Vec<u8>> {
        Some(vec![0x60; 256])
    }

    fn select_image(&self, _slot: u8, _unit: usize, suggested: &Path) -> Option<PathBuf> {
        self.selects.borrow_mut().push(suggested.to_path_buf());
        self.select_response.borrow_mut().take()
    }

    fn paths_updated(&self) {
        self.path_updates.set(self.path_updates.get() + 1);
    }

    fn invalid_image(&self, path: &Path) {
        self.invalid.borrow_mut().push(path.to_path_buf());
    }
}

pub struct TestHost {
    pub ctx: HostContext,
    pub bus: Rc<RefCell<IoBus>>,
    pub memory: Rc<RefCell<Memory>>,
    pub codec: Rc<MemCodec>,
    pub config: Rc<RefCell<MemConfig>>,
    pub frontend: Rc<TestFrontend>,
}

pub fn host() -> TestHost {
    let bus = Rc::new(RefCell::new(IoBus::new()));
    let memory = Rc::new(RefCell::new(Memory::new()));
    let codec = Rc::new(MemCodec::default());
    let config = Rc::new(RefCell::new(MemConfig::default()));
    let frontend = Rc::new(TestFrontend::default());
    let ctx = HostContext {
        bus: Some(Rc::clone(&bus)),
        memory: Rc::clone(&memory),
        codec: codec.clone(),
        config: config.clone(),
        frontend: frontend.clone(),
    };
    TestHost {
        ctx,
        bus,
        memory,
        codec,
        config,
        frontend,
    }
}

pub fn registry() -> (SlotRegistry, TestHost) {
    let host = host();
    let registry = SlotRegistry::new(host.ctx.clone());
    (registry, host)
}

pub fn hd_read(bus: &Rc<RefCell<IoBus>>, slot: u8, port: u16) -> u8 {
    bus.borrow_mut().io_read(0, 0xC080 + (slot as u16) * 16 + port, 0)
}

pub fn hd_write(bus: &Rc<RefCell<IoBus>>, slot: u8, port: u16, value: u8) {
    bus.borrow_mut()
        .io_write(0, 0xC080 + (slot as u16) * 16 + port, value, 0);
}
