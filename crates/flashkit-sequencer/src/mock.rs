//! Simulated bus for testing without hardware
//!
//! [`MockBus`] implements both protocol families over shared state. Clones
//! share that state, so a test can hand one clone to the sequencer and inspect
//! or manipulate the nodes through another.
//!
//! ```no_run
//! use flashkit_sequencer::mock::{MockBus, MockNode};
//! use flashkit_sequencer::FlashBlock;
//!
//! let bus = MockBus::new(0);
//! bus.add_node(0, 1, MockNode::modern("ECU_A", vec![FlashBlock { address: 0, size: 0x1000 }]));
//! bus.set_responsive(0, 1, false);
//! ```

use flashkit_system::FlashloaderKind;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use crate::progress::AbortSignal;
use crate::protocol::{
    DriverError, DriverResult, FlashBlock, FlashloaderInfo, Fingerprint, LegacyDeviceInfo,
    LegacyProtocol, ModernFeatures, ModernProtocol, NodeAddress, Sector,
};

/// Negative response code for requests outside a valid sequence
const REQUEST_SEQUENCE_ERROR: u8 = 0x24;

/// One simulated node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockNode {
    pub family: FlashloaderKind,
    pub device_name: String,
    pub flashloader: FlashloaderInfo,
    pub flash_blocks: Vec<FlashBlock>,
    pub legacy_info: LegacyDeviceInfo,
    /// Answers requests at all
    pub responsive: bool,
    /// Rejects reset requests
    pub fail_reset: bool,
    pub in_flashloader: bool,
    pub routing_to: BTreeSet<u8>,
    /// Completed downloads and file transfers as (address, bytes); files use address 0
    pub downloads: Vec<(u32, Vec<u8>)>,
    /// Named files received by file based transfer
    pub files: BTreeMap<String, Vec<u8>>,
    pub nvm: Vec<(u32, Vec<u8>)>,
    pub pem: Option<Vec<u8>>,
    pub security_state: Option<bool>,
    pub debugger_state: Option<bool>,
    pub fingerprint: Option<Fingerprint>,
    pub erased: Vec<(u32, u32)>,
    pub programmed: Vec<(u32, Vec<u8>)>,
    pub finished: bool,
    pub blocks_received: usize,
    pub reset_count: usize,
    pending: Option<Pending>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pending {
    Download { address: u32, size: u32, data: Vec<u8> },
    File { name: String, size: u32, data: Vec<u8> },
}

impl MockNode {
    /// Modern node supporting every optional service
    pub fn modern(device_name: &str, flash_blocks: Vec<FlashBlock>) -> Self {
        Self::new(
            FlashloaderKind::Modern,
            device_name,
            FlashloaderInfo {
                version: "V1.04r0".into(),
                protocol_version: "V3.00r0".into(),
                features: ModernFeatures {
                    fingerprint: true,
                    file_based_transfer: true,
                    nvm_write: true,
                    pem_write: true,
                    security_state: true,
                    debugger_state: true,
                    max_block_size: Some(4090),
                },
            },
            flash_blocks,
            LegacyDeviceInfo::default(),
        )
    }

    pub fn legacy(device_name: &str, sectors: Vec<Sector>) -> Self {
        Self::new(
            FlashloaderKind::Legacy,
            device_name,
            FlashloaderInfo::default(),
            Vec::new(),
            LegacyDeviceInfo {
                flashloader_version: "V2.01".into(),
                sectors,
                applications: Vec::new(),
            },
        )
    }

    fn new(
        family: FlashloaderKind,
        device_name: &str,
        flashloader: FlashloaderInfo,
        flash_blocks: Vec<FlashBlock>,
        legacy_info: LegacyDeviceInfo,
    ) -> Self {
        Self {
            family,
            device_name: device_name.to_string(),
            flashloader,
            flash_blocks,
            legacy_info,
            responsive: true,
            fail_reset: false,
            in_flashloader: false,
            routing_to: BTreeSet::new(),
            downloads: Vec::new(),
            files: BTreeMap::new(),
            nvm: Vec::new(),
            pem: None,
            security_state: None,
            debugger_state: None,
            fingerprint: None,
            erased: Vec::new(),
            programmed: Vec::new(),
            finished: false,
            blocks_received: 0,
            reset_count: 0,
            pending: None,
        }
    }

    /// Sum of all programmed bytes, as the legacy flashloader reports it
    pub fn checksum(&self) -> u32 {
        self.programmed
            .iter()
            .flat_map(|(_, data)| data.iter())
            .fold(0u32, |acc, b| acc.wrapping_add(u32::from(*b)))
    }

    fn reset(&mut self) {
        self.reset_count += 1;
        self.in_flashloader = false;
        self.routing_to.clear();
        self.pending = None;
    }
}

/// Raises an abort once a node has received a number of data blocks
#[derive(Debug, Clone)]
struct AbortTrigger {
    node: (u8, u8),
    after_blocks: usize,
    signal: AbortSignal,
}

/// Shared mock state for synchronized access
#[derive(Debug)]
pub struct MockBusState {
    /// Bus the tester is connected to
    pub local_bus: u8,
    pub broadcast: bool,
    pub nodes: BTreeMap<(u8, u8), MockNode>,
    /// Every request in order, as `service@bus:node`
    pub calls: Vec<String>,
    abort_trigger: Option<AbortTrigger>,
}

impl MockBusState {
    fn reachable_buses(&self) -> BTreeSet<u8> {
        let mut buses = BTreeSet::from([self.local_bus]);
        loop {
            let before = buses.len();
            let routed: Vec<u8> = self
                .nodes
                .iter()
                .filter(|((bus, _), node)| buses.contains(bus) && node.responsive)
                .flat_map(|(_, node)| node.routing_to.iter().copied())
                .collect();
            buses.extend(routed);
            if buses.len() == before {
                return buses;
            }
        }
    }
}

/// Simulated CAN/Ethernet bus with modern and legacy nodes
#[derive(Debug, Clone)]
pub struct MockBus {
    state: Arc<RwLock<MockBusState>>,
}

impl MockBus {
    /// Bus with the tester attached to `local_bus`; broadcasts supported
    pub fn new(local_bus: u8) -> Self {
        Self {
            state: Arc::new(RwLock::new(MockBusState {
                local_bus,
                broadcast: true,
                nodes: BTreeMap::new(),
                calls: Vec::new(),
                abort_trigger: None,
            })),
        }
    }

    pub fn without_broadcast(self) -> Self {
        if let Ok(mut state) = self.state.write() {
            state.broadcast = false;
        }
        self
    }

    pub fn add_node(&self, bus_id: u8, node_id: u8, node: MockNode) {
        if let Ok(mut state) = self.state.write() {
            state.nodes.insert((bus_id, node_id), node);
        }
    }

    pub fn set_responsive(&self, bus_id: u8, node_id: u8, responsive: bool) {
        self.update(bus_id, node_id, |node| node.responsive = responsive);
    }

    pub fn set_fail_reset(&self, bus_id: u8, node_id: u8, fail: bool) {
        self.update(bus_id, node_id, |node| node.fail_reset = fail);
    }

    pub fn set_device_name(&self, bus_id: u8, node_id: u8, name: &str) {
        self.update(bus_id, node_id, |node| node.device_name = name.to_string());
    }

    /// Abort `signal` once the node received `after_blocks` data blocks
    pub fn abort_after_blocks(
        &self,
        bus_id: u8,
        node_id: u8,
        after_blocks: usize,
        signal: AbortSignal,
    ) {
        if let Ok(mut state) = self.state.write() {
            state.abort_trigger = Some(AbortTrigger {
                node: (bus_id, node_id),
                after_blocks,
                signal,
            });
        }
    }

    /// Snapshot of one node
    pub fn node(&self, bus_id: u8, node_id: u8) -> Option<MockNode> {
        self.state
            .read()
            .ok()
            .and_then(|state| state.nodes.get(&(bus_id, node_id)).cloned())
    }

    pub fn calls(&self) -> Vec<String> {
        self.state
            .read()
            .map(|state| state.calls.clone())
            .unwrap_or_default()
    }

    /// Get shared state for manipulation in tests
    pub fn state(&self) -> Arc<RwLock<MockBusState>> {
        Arc::clone(&self.state)
    }

    fn update(&self, bus_id: u8, node_id: u8, change: impl FnOnce(&mut MockNode)) {
        if let Ok(mut state) = self.state.write() {
            if let Some(node) = state.nodes.get_mut(&(bus_id, node_id)) {
                change(node);
            }
        }
    }

    /// Run `handler` on a reachable, responsive node of the given family
    fn with_node<T>(
        &self,
        service: &str,
        address: &NodeAddress,
        family: FlashloaderKind,
        handler: impl FnOnce(&mut MockNode) -> DriverResult<T>,
    ) -> DriverResult<T> {
        let mut state = self
            .state
            .write()
            .map_err(|_| DriverError::Transport("mock state poisoned".into()))?;
        state
            .calls
            .push(format!("{}@{}:{}", service, address.bus_id, address.node_id));
        tracing::debug!("[MOCK] {} to {}", service, address);

        if !state.reachable_buses().contains(&address.bus_id) {
            return Err(DriverError::NoResponse);
        }

        let trigger = state.abort_trigger.clone();
        let key = (address.bus_id, address.node_id);
        let node = state.nodes.get_mut(&key).ok_or(DriverError::NoResponse)?;
        if !node.responsive || node.family != family {
            return Err(DriverError::NoResponse);
        }

        let blocks_before = node.blocks_received;
        let result = handler(node);

        if let Some(trigger) = trigger {
            if trigger.node == key
                && node.blocks_received > blocks_before
                && node.blocks_received >= trigger.after_blocks
            {
                trigger.signal.abort();
            }
        }
        result
    }

    fn broadcast(
        &self,
        service: &str,
        bus_id: u8,
        action: impl Fn(&mut MockNode),
    ) -> DriverResult<()> {
        let mut state = self
            .state
            .write()
            .map_err(|_| DriverError::Transport("mock state poisoned".into()))?;
        if !state.broadcast {
            return Err(DriverError::Unsupported("broadcast".into()));
        }
        state.calls.push(format!("{}@{}", service, bus_id));

        for ((bus, _), node) in state.nodes.iter_mut() {
            if *bus == bus_id && node.responsive && node.family == FlashloaderKind::Modern {
                action(node);
            }
        }
        Ok(())
    }

    fn modern<T>(
        &self,
        service: &str,
        address: &NodeAddress,
        handler: impl FnOnce(&mut MockNode) -> DriverResult<T>,
    ) -> DriverResult<T> {
        self.with_node(service, address, FlashloaderKind::Modern, handler)
    }

    fn legacy<T>(
        &self,
        service: &str,
        address: &NodeAddress,
        handler: impl FnOnce(&mut MockNode) -> DriverResult<T>,
    ) -> DriverResult<T> {
        self.with_node(service, address, FlashloaderKind::Legacy, handler)
    }
}

fn sequence_error(service: u8) -> DriverError {
    DriverError::NegativeResponse {
        service,
        code: REQUEST_SEQUENCE_ERROR,
    }
}

impl ModernProtocol for MockBus {
    fn supports_broadcast(&self) -> bool {
        self.state.read().map(|s| s.broadcast).unwrap_or(false)
    }

    fn broadcast_ecu_reset(&mut self, bus_id: u8) -> DriverResult<()> {
        self.broadcast("broadcast_ecu_reset", bus_id, |node| {
            if !node.fail_reset {
                node.reset();
            }
        })
    }

    fn broadcast_enter_pre_programming(&mut self, bus_id: u8) -> DriverResult<()> {
        self.broadcast("broadcast_enter_pre_programming", bus_id, |node| {
            node.in_flashloader = true;
        })
    }

    fn request_programming(&mut self, node: &NodeAddress) -> DriverResult<()> {
        self.modern("request_programming", node, |_| Ok(()))
    }

    fn ecu_reset(&mut self, node: &NodeAddress) -> DriverResult<()> {
        self.modern("ecu_reset", node, |n| {
            if n.fail_reset {
                return Err(sequence_error(0x11));
            }
            n.reset();
            Ok(())
        })
    }

    fn enter_pre_programming_session(&mut self, node: &NodeAddress) -> DriverResult<()> {
        self.modern("enter_pre_programming_session", node, |n| {
            n.in_flashloader = true;
            Ok(())
        })
    }

    fn enter_programming_session(&mut self, node: &NodeAddress) -> DriverResult<()> {
        self.modern("enter_programming_session", node, |n| {
            if n.in_flashloader {
                Ok(())
            } else {
                Err(sequence_error(0x10))
            }
        })
    }

    fn activate_routing(&mut self, router: &NodeAddress, out_bus_id: u8) -> DriverResult<()> {
        self.modern("activate_routing", router, |n| {
            n.routing_to.insert(out_bus_id);
            Ok(())
        })
    }

    fn read_device_name(&mut self, node: &NodeAddress) -> DriverResult<String> {
        self.modern("read_device_name", node, |n| Ok(n.device_name.clone()))
    }

    fn read_flashloader_info(&mut self, node: &NodeAddress) -> DriverResult<FlashloaderInfo> {
        self.modern("read_flashloader_info", node, |n| Ok(n.flashloader.clone()))
    }

    fn read_flash_blocks(&mut self, node: &NodeAddress) -> DriverResult<Vec<FlashBlock>> {
        self.modern("read_flash_blocks", node, |n| Ok(n.flash_blocks.clone()))
    }

    fn write_fingerprint(
        &mut self,
        node: &NodeAddress,
        fingerprint: &Fingerprint,
    ) -> DriverResult<()> {
        self.modern("write_fingerprint", node, |n| {
            n.fingerprint = Some(fingerprint.clone());
            Ok(())
        })
    }

    fn request_download(
        &mut self,
        node: &NodeAddress,
        address: u32,
        size: u32,
    ) -> DriverResult<u32> {
        self.modern("request_download", node, |n| {
            if !n.in_flashloader || n.pending.is_some() {
                return Err(sequence_error(0x34));
            }
            n.pending = Some(Pending::Download {
                address,
                size,
                data: Vec::new(),
            });
            Ok(n.flashloader.features.max_block_size.unwrap_or(4090))
        })
    }

    fn request_file_transfer(
        &mut self,
        node: &NodeAddress,
        name: &str,
        size: u32,
    ) -> DriverResult<u32> {
        self.modern("request_file_transfer", node, |n| {
            if !n.in_flashloader || n.pending.is_some() {
                return Err(sequence_error(0x38));
            }
            n.pending = Some(Pending::File {
                name: name.to_string(),
                size,
                data: Vec::new(),
            });
            Ok(n.flashloader.features.max_block_size.unwrap_or(4090))
        })
    }

    fn transfer_data(
        &mut self,
        node: &NodeAddress,
        _sequence: u8,
        data: &[u8],
    ) -> DriverResult<()> {
        self.modern("transfer_data", node, |n| {
            match &mut n.pending {
                Some(Pending::Download { data: buffer, .. })
                | Some(Pending::File { data: buffer, .. }) => {
                    buffer.extend_from_slice(data);
                }
                None => return Err(sequence_error(0x36)),
            }
            n.blocks_received += 1;
            Ok(())
        })
    }

    fn request_transfer_exit(&mut self, node: &NodeAddress) -> DriverResult<()> {
        self.modern("request_transfer_exit", node, |n| match n.pending.take() {
            Some(Pending::Download { address, size, data }) if data.len() == size as usize => {
                n.downloads.push((address, data));
                Ok(())
            }
            Some(Pending::File { name, size, data }) if data.len() == size as usize => {
                n.files.insert(name, data);
                Ok(())
            }
            _ => Err(sequence_error(0x37)),
        })
    }

    fn write_nvm(&mut self, node: &NodeAddress, address: u32, data: &[u8]) -> DriverResult<()> {
        self.modern("write_nvm", node, |n| {
            n.nvm.push((address, data.to_vec()));
            Ok(())
        })
    }

    fn write_pem(&mut self, node: &NodeAddress, pem: &[u8]) -> DriverResult<()> {
        self.modern("write_pem", node, |n| {
            n.pem = Some(pem.to_vec());
            Ok(())
        })
    }

    fn write_security_state(&mut self, node: &NodeAddress, enabled: bool) -> DriverResult<()> {
        self.modern("write_security_state", node, |n| {
            n.security_state = Some(enabled);
            Ok(())
        })
    }

    fn write_debugger_state(&mut self, node: &NodeAddress, enabled: bool) -> DriverResult<()> {
        self.modern("write_debugger_state", node, |n| {
            n.debugger_state = Some(enabled);
            Ok(())
        })
    }
}

impl LegacyProtocol for MockBus {
    fn send_flash_request(&mut self, node: &NodeAddress) -> DriverResult<()> {
        self.legacy("send_flash_request", node, |_| Ok(()))
    }

    fn wake_up(&mut self, node: &NodeAddress) -> DriverResult<()> {
        self.legacy("wake_up", node, |n| {
            n.in_flashloader = true;
            Ok(())
        })
    }

    fn read_device_name(&mut self, node: &NodeAddress) -> DriverResult<String> {
        self.legacy("read_device_name", node, |n| Ok(n.device_name.clone()))
    }

    fn read_device_info(&mut self, node: &NodeAddress) -> DriverResult<LegacyDeviceInfo> {
        self.legacy("read_device_info", node, |n| Ok(n.legacy_info.clone()))
    }

    fn read_checksum(&mut self, node: &NodeAddress) -> DriverResult<u32> {
        self.legacy("read_checksum", node, |n| Ok(n.checksum()))
    }

    fn erase(&mut self, node: &NodeAddress, address: u32, size: u32) -> DriverResult<()> {
        self.legacy("erase", node, |n| {
            if !n.in_flashloader {
                return Err(sequence_error(0x31));
            }
            n.erased.push((address, size));
            n.finished = false;
            Ok(())
        })
    }

    fn program(&mut self, node: &NodeAddress, address: u32, data: &[u8]) -> DriverResult<()> {
        self.legacy("program", node, |n| {
            let erased = n.erased.iter().any(|&(start, size)| {
                address >= start
                    && u64::from(address) + data.len() as u64 <= u64::from(start) + u64::from(size)
            });
            if !erased {
                return Err(sequence_error(0x32));
            }
            n.programmed.push((address, data.to_vec()));
            n.blocks_received += 1;
            Ok(())
        })
    }

    fn finish(&mut self, node: &NodeAddress) -> DriverResult<()> {
        self.legacy("finish", node, |n| {
            n.finished = true;
            Ok(())
        })
    }

    fn reset(&mut self, node: &NodeAddress) -> DriverResult<()> {
        self.legacy("reset", node, |n| {
            if n.fail_reset {
                return Err(sequence_error(0x11));
            }
            n.reset();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> Vec<FlashBlock> {
        vec![FlashBlock {
            address: 0x1000,
            size: 0x1000,
        }]
    }

    #[test]
    fn test_unresponsive_node() {
        let mut bus = MockBus::new(0);
        bus.add_node(0, 1, MockNode::modern("ECU", block()));
        bus.set_responsive(0, 1, false);

        let result = ModernProtocol::read_device_name(&mut bus, &NodeAddress::new(0, 1));
        assert_eq!(result, Err(DriverError::NoResponse));
        assert_eq!(bus.calls(), vec!["read_device_name@0:1".to_string()]);
    }

    #[test]
    fn test_family_mismatch_is_silent() {
        let mut bus = MockBus::new(0);
        bus.add_node(0, 2, MockNode::legacy("OLD", block()));
        assert!(bus.enter_pre_programming_session(&NodeAddress::new(0, 2)).is_err());
        assert!(bus.wake_up(&NodeAddress::new(0, 2)).is_ok());
    }

    #[test]
    fn test_download_sequence() {
        let mut bus = MockBus::new(0);
        let address = NodeAddress::new(0, 1);
        bus.add_node(0, 1, MockNode::modern("ECU", block()));

        assert!(bus.request_download(&address, 0x1000, 4).is_err());
        bus.enter_pre_programming_session(&address).unwrap();
        bus.request_download(&address, 0x1000, 4).unwrap();
        bus.transfer_data(&address, 1, &[1, 2]).unwrap();
        assert!(bus.request_transfer_exit(&address).is_err());

        bus.request_download(&address, 0x1000, 4).unwrap();
        bus.transfer_data(&address, 1, &[1, 2]).unwrap();
        bus.transfer_data(&address, 2, &[3, 4]).unwrap();
        bus.request_transfer_exit(&address).unwrap();

        let node = bus.node(0, 1).unwrap();
        assert_eq!(node.downloads, vec![(0x1000, vec![1, 2, 3, 4])]);
        assert_eq!(node.blocks_received, 3);
    }

    #[test]
    fn test_routing_makes_bus_reachable() {
        let mut bus = MockBus::new(0);
        bus.add_node(0, 1, MockNode::modern("GATEWAY", block()));
        bus.add_node(1, 5, MockNode::modern("ECU", block()));
        let target = NodeAddress::new(1, 5);

        assert!(ModernProtocol::read_device_name(&mut bus, &target).is_err());
        bus.activate_routing(&NodeAddress::new(0, 1), 1).unwrap();
        assert_eq!(
            ModernProtocol::read_device_name(&mut bus, &target).unwrap(),
            "ECU"
        );

        bus.ecu_reset(&NodeAddress::new(0, 1)).unwrap();
        assert!(ModernProtocol::read_device_name(&mut bus, &target).is_err());
    }

    #[test]
    fn test_legacy_programming_checksum() {
        let mut bus = MockBus::new(0);
        let address = NodeAddress::new(0, 3);
        bus.add_node(0, 3, MockNode::legacy("OLD", block()));

        bus.wake_up(&address).unwrap();
        assert!(bus.program(&address, 0x1000, &[1]).is_err());
        bus.erase(&address, 0x1000, 0x10).unwrap();
        bus.program(&address, 0x1000, &[1, 2, 3]).unwrap();
        bus.finish(&address).unwrap();
        assert_eq!(bus.read_checksum(&address).unwrap(), 6);
    }

    #[test]
    fn test_abort_trigger() {
        let mut bus = MockBus::new(0);
        let address = NodeAddress::new(0, 1);
        let signal = AbortSignal::new();
        bus.add_node(0, 1, MockNode::modern("ECU", block()));
        bus.abort_after_blocks(0, 1, 2, signal.clone());

        bus.enter_pre_programming_session(&address).unwrap();
        bus.request_download(&address, 0x1000, 3).unwrap();
        bus.transfer_data(&address, 1, &[1]).unwrap();
        assert!(!signal.is_aborted());
        bus.transfer_data(&address, 2, &[2]).unwrap();
        assert!(signal.is_aborted());
    }

    #[test]
    fn test_broadcast_disabled() {
        let mut bus = MockBus::new(0).without_broadcast();
        assert!(!bus.supports_broadcast());
        assert!(bus.broadcast_ecu_reset(0).is_err());
    }
}
