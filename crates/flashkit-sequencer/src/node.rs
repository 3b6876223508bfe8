//! Per node state of a sequencer run

use flashkit_system::Route;
use thiserror::Error;

use crate::protocol::{DriverError, FlashBlock, FlashloaderInfo, LegacyDeviceInfo, NodeAddress};

/// Why a node could not be handled
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeFailure {
    #[error("Device reports name {reported}, expected {expected}")]
    DeviceMismatch { expected: String, reported: String },

    #[error("Not supported by the device: {0}")]
    FeatureUnsupported(String),

    #[error("Protocol error during {step}: {source}")]
    Protocol {
        step: String,
        #[source]
        source: DriverError,
    },

    #[error("Router {router} is not available")]
    RouterUnavailable { router: String },
}

impl NodeFailure {
    pub(crate) fn protocol(step: &str, source: DriverError) -> Self {
        Self::Protocol {
            step: step.to_string(),
            source,
        }
    }
}

/// Where a node stands in the current run
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NodeStatus {
    /// Not addressed yet
    #[default]
    Idle,
    /// Waiting in its flashloader
    Activated,
    /// Device information read
    Identified,
    /// Transfer started but not completed
    Incomplete,
    Updated,
    Reset,
    Failed(NodeFailure),
}

impl NodeStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, NodeStatus::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModernNode {
    pub address: NodeAddress,
    pub device_name: Option<String>,
    pub flashloader: Option<FlashloaderInfo>,
    pub flash_blocks: Vec<FlashBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyNode {
    pub address: NodeAddress,
    pub device_name: Option<String>,
    pub info: Option<LegacyDeviceInfo>,
    pub checksum: Option<u32>,
}

/// Protocol family specific state of one active node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeDevice {
    Modern(ModernNode),
    Legacy(LegacyNode),
}

impl NodeDevice {
    pub fn modern(address: NodeAddress) -> Self {
        NodeDevice::Modern(ModernNode {
            address,
            device_name: None,
            flashloader: None,
            flash_blocks: Vec::new(),
        })
    }

    pub fn legacy(address: NodeAddress) -> Self {
        NodeDevice::Legacy(LegacyNode {
            address,
            device_name: None,
            info: None,
            checksum: None,
        })
    }

    pub fn address(&self) -> &NodeAddress {
        match self {
            NodeDevice::Modern(node) => &node.address,
            NodeDevice::Legacy(node) => &node.address,
        }
    }

    pub fn device_name(&self) -> Option<&str> {
        match self {
            NodeDevice::Modern(node) => node.device_name.as_deref(),
            NodeDevice::Legacy(node) => node.device_name.as_deref(),
        }
    }
}

/// An active node with its path from the active bus
#[derive(Debug, Clone)]
pub(crate) struct NodeSlot {
    pub device: NodeDevice,
    pub route: Route,
    pub status: NodeStatus,
    /// Entered its flashloader during this run and not reset since
    pub in_flashloader: bool,
}

/// Identity and capabilities read from one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub node: usize,
    pub device_name: String,
    pub details: DeviceDetails,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceDetails {
    Modern {
        flashloader: FlashloaderInfo,
        flash_blocks: Vec<FlashBlock>,
    },
    Legacy {
        info: LegacyDeviceInfo,
        checksum: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_accessors() {
        let mut device = NodeDevice::legacy(NodeAddress::new(0, 4));
        assert_eq!(device.address().node_id, 4);
        assert_eq!(device.device_name(), None);

        if let NodeDevice::Legacy(node) = &mut device {
            node.device_name = Some("ESX3CM".into());
        }
        assert_eq!(device.device_name(), Some("ESX3CM"));
    }

    #[test]
    fn test_failure_display() {
        let failure = NodeFailure::protocol("wake-up", DriverError::NoResponse);
        assert_eq!(failure.to_string(), "Protocol error during wake-up: No response");
    }
}
