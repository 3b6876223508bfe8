//! Protocol driver capabilities
//!
//! The sequencer never talks to a transport directly. It drives the two
//! flashloader families through these traits; real CAN/Ethernet stacks and the
//! [`MockBus`](crate::mock::MockBus) implement them.

use chrono::{DateTime, Datelike, Local, Timelike};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("No response")]
    NoResponse,

    #[error("Negative response 0x{code:02X} to service 0x{service:02X}")]
    NegativeResponse { service: u8, code: u8 },

    #[error("Service not supported: {0}")]
    Unsupported(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Protocol address of a node on one bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddress {
    pub bus_id: u8,
    pub node_id: u8,
    pub ip_address: Option<[u8; 4]>,
}

impl NodeAddress {
    pub fn new(bus_id: u8, node_id: u8) -> Self {
        Self {
            bus_id,
            node_id,
            ip_address: None,
        }
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.ip_address {
            Some([a, b, c, d]) => write!(f, "{}.{}.{}.{}", a, b, c, d),
            None => write!(f, "bus {} node {}", self.bus_id, self.node_id),
        }
    }
}

/// Optional services of a modern flashloader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModernFeatures {
    pub fingerprint: bool,
    pub file_based_transfer: bool,
    pub nvm_write: bool,
    pub pem_write: bool,
    pub security_state: bool,
    pub debugger_state: bool,
    /// Largest transfer-data payload the node accepts
    pub max_block_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlashloaderInfo {
    pub version: String,
    pub protocol_version: String,
    pub features: ModernFeatures,
}

/// Writable flash region reported by a modern node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashBlock {
    pub address: u32,
    pub size: u32,
}

impl FlashBlock {
    pub fn contains(&self, address: u32, len: usize) -> bool {
        let end = u64::from(address) + len as u64;
        address >= self.address && end <= u64::from(self.address) + u64::from(self.size)
    }
}

/// Erasable sector of a legacy node
pub type Sector = FlashBlock;

/// Application slot described by a legacy flashloader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationBlock {
    pub name: String,
    pub version: String,
    pub start_address: u32,
    pub end_address: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LegacyDeviceInfo {
    pub flashloader_version: String,
    pub sectors: Vec<Sector>,
    pub applications: Vec<ApplicationBlock>,
}

/// Build marker written before an application transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// Year (two digits), month, day
    pub date: [u8; 3],
    /// Hours, minutes, seconds
    pub time: [u8; 3],
    pub user: String,
}

impl Fingerprint {
    pub fn new(at: DateTime<Local>, user: &str) -> Self {
        Self {
            date: [(at.year() % 100) as u8, at.month() as u8, at.day() as u8],
            time: [at.hour() as u8, at.minute() as u8, at.second() as u8],
            user: user.to_string(),
        }
    }

    pub fn now(user: &str) -> Self {
        Self::new(Local::now(), user)
    }
}

/// Session based flashloader protocol
pub trait ModernProtocol: Send {
    /// Whether bus-wide requests are available on this transport
    fn supports_broadcast(&self) -> bool;

    fn broadcast_ecu_reset(&mut self, bus_id: u8) -> DriverResult<()>;
    fn broadcast_enter_pre_programming(&mut self, bus_id: u8) -> DriverResult<()>;

    /// Ask a running application to stay in the flashloader after the next reset
    fn request_programming(&mut self, node: &NodeAddress) -> DriverResult<()>;
    fn ecu_reset(&mut self, node: &NodeAddress) -> DriverResult<()>;
    fn enter_pre_programming_session(&mut self, node: &NodeAddress) -> DriverResult<()>;
    fn enter_programming_session(&mut self, node: &NodeAddress) -> DriverResult<()>;

    /// Forward traffic arriving on the router's addressed bus to `out_bus_id`
    fn activate_routing(&mut self, router: &NodeAddress, out_bus_id: u8) -> DriverResult<()>;

    fn read_device_name(&mut self, node: &NodeAddress) -> DriverResult<String>;
    fn read_flashloader_info(&mut self, node: &NodeAddress) -> DriverResult<FlashloaderInfo>;
    fn read_flash_blocks(&mut self, node: &NodeAddress) -> DriverResult<Vec<FlashBlock>>;

    fn write_fingerprint(&mut self, node: &NodeAddress, fingerprint: &Fingerprint)
    -> DriverResult<()>;

    /// Returns the largest block the node accepts for this download
    fn request_download(&mut self, node: &NodeAddress, address: u32, size: u32)
    -> DriverResult<u32>;
    /// Returns the largest block the node accepts for this file
    fn request_file_transfer(&mut self, node: &NodeAddress, name: &str, size: u32)
    -> DriverResult<u32>;
    fn transfer_data(&mut self, node: &NodeAddress, sequence: u8, data: &[u8])
    -> DriverResult<()>;
    fn request_transfer_exit(&mut self, node: &NodeAddress) -> DriverResult<()>;

    fn write_nvm(&mut self, node: &NodeAddress, address: u32, data: &[u8]) -> DriverResult<()>;
    fn write_pem(&mut self, node: &NodeAddress, pem: &[u8]) -> DriverResult<()>;
    fn write_security_state(&mut self, node: &NodeAddress, enabled: bool) -> DriverResult<()>;
    fn write_debugger_state(&mut self, node: &NodeAddress, enabled: bool) -> DriverResult<()>;
}

/// Wake-up based flashloader protocol
pub trait LegacyProtocol: Send {
    /// Ask the application to jump into the flashloader
    fn send_flash_request(&mut self, node: &NodeAddress) -> DriverResult<()>;
    /// Handshake with a node waiting in its flashloader
    fn wake_up(&mut self, node: &NodeAddress) -> DriverResult<()>;

    fn read_device_name(&mut self, node: &NodeAddress) -> DriverResult<String>;
    fn read_device_info(&mut self, node: &NodeAddress) -> DriverResult<LegacyDeviceInfo>;
    fn read_checksum(&mut self, node: &NodeAddress) -> DriverResult<u32>;

    fn erase(&mut self, node: &NodeAddress, address: u32, size: u32) -> DriverResult<()>;
    fn program(&mut self, node: &NodeAddress, address: u32, data: &[u8]) -> DriverResult<()>;
    /// Close the programming sequence
    fn finish(&mut self, node: &NodeAddress) -> DriverResult<()>;

    fn reset(&mut self, node: &NodeAddress) -> DriverResult<()>;
}

/// Placeholder for a protocol family without driver; every request fails
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDriver;

impl NoDriver {
    fn missing<T>() -> DriverResult<T> {
        Err(DriverError::Unsupported("no driver installed for this protocol".into()))
    }
}

impl ModernProtocol for NoDriver {
    fn supports_broadcast(&self) -> bool {
        false
    }

    fn broadcast_ecu_reset(&mut self, _bus_id: u8) -> DriverResult<()> {
        Self::missing()
    }

    fn broadcast_enter_pre_programming(&mut self, _bus_id: u8) -> DriverResult<()> {
        Self::missing()
    }

    fn request_programming(&mut self, _node: &NodeAddress) -> DriverResult<()> {
        Self::missing()
    }

    fn ecu_reset(&mut self, _node: &NodeAddress) -> DriverResult<()> {
        Self::missing()
    }

    fn enter_pre_programming_session(&mut self, _node: &NodeAddress) -> DriverResult<()> {
        Self::missing()
    }

    fn enter_programming_session(&mut self, _node: &NodeAddress) -> DriverResult<()> {
        Self::missing()
    }

    fn activate_routing(&mut self, _router: &NodeAddress, _out_bus_id: u8) -> DriverResult<()> {
        Self::missing()
    }

    fn read_device_name(&mut self, _node: &NodeAddress) -> DriverResult<String> {
        Self::missing()
    }

    fn read_flashloader_info(&mut self, _node: &NodeAddress) -> DriverResult<FlashloaderInfo> {
        Self::missing()
    }

    fn read_flash_blocks(&mut self, _node: &NodeAddress) -> DriverResult<Vec<FlashBlock>> {
        Self::missing()
    }

    fn write_fingerprint(&mut self, _node: &NodeAddress, _fp: &Fingerprint) -> DriverResult<()> {
        Self::missing()
    }

    fn request_download(&mut self, _node: &NodeAddress, _address: u32, _size: u32)
    -> DriverResult<u32> {
        Self::missing()
    }

    fn request_file_transfer(&mut self, _node: &NodeAddress, _name: &str, _size: u32)
    -> DriverResult<u32> {
        Self::missing()
    }

    fn transfer_data(&mut self, _node: &NodeAddress, _sequence: u8, _data: &[u8])
    -> DriverResult<()> {
        Self::missing()
    }

    fn request_transfer_exit(&mut self, _node: &NodeAddress) -> DriverResult<()> {
        Self::missing()
    }

    fn write_nvm(&mut self, _node: &NodeAddress, _address: u32, _data: &[u8]) -> DriverResult<()> {
        Self::missing()
    }

    fn write_pem(&mut self, _node: &NodeAddress, _pem: &[u8]) -> DriverResult<()> {
        Self::missing()
    }

    fn write_security_state(&mut self, _node: &NodeAddress, _enabled: bool) -> DriverResult<()> {
        Self::missing()
    }

    fn write_debugger_state(&mut self, _node: &NodeAddress, _enabled: bool) -> DriverResult<()> {
        Self::missing()
    }
}

impl LegacyProtocol for NoDriver {
    fn send_flash_request(&mut self, _node: &NodeAddress) -> DriverResult<()> {
        Self::missing()
    }

    fn wake_up(&mut self, _node: &NodeAddress) -> DriverResult<()> {
        Self::missing()
    }

    fn read_device_name(&mut self, _node: &NodeAddress) -> DriverResult<String> {
        Self::missing()
    }

    fn read_device_info(&mut self, _node: &NodeAddress) -> DriverResult<LegacyDeviceInfo> {
        Self::missing()
    }

    fn read_checksum(&mut self, _node: &NodeAddress) -> DriverResult<u32> {
        Self::missing()
    }

    fn erase(&mut self, _node: &NodeAddress, _address: u32, _size: u32) -> DriverResult<()> {
        Self::missing()
    }

    fn program(&mut self, _node: &NodeAddress, _address: u32, _data: &[u8]) -> DriverResult<()> {
        Self::missing()
    }

    fn finish(&mut self, _node: &NodeAddress) -> DriverResult<()> {
        Self::missing()
    }

    fn reset(&mut self, _node: &NodeAddress) -> DriverResult<()> {
        Self::missing()
    }
}
