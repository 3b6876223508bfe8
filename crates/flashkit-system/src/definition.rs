//! Buses, nodes and gateway routes

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

use crate::{Result, SystemError};

/// Physical bus type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Can,
    Ethernet,
}

impl BusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusKind::Can => "can",
            BusKind::Ethernet => "ethernet",
        }
    }
}

/// A physical bus segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bus {
    pub name: String,
    pub kind: BusKind,
    /// Bus identifier used in protocol addressing
    pub bus_id: u8,
    /// CAN bitrate (unused on Ethernet)
    #[serde(default)]
    pub bitrate_kbps: Option<u32>,
}

/// Flashloader family running on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashloaderKind {
    /// Session based protocol with flash block info and optional file transfer
    Modern,
    /// Wake-up handshake, monolithic hex transfer
    Legacy,
    /// Node can not be updated
    None,
}

/// Connection of a node to one bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInterface {
    pub bus_index: usize,
    pub node_id: u8,
    #[serde(default)]
    pub ip_address: Option<[u8; 4]>,
    /// Node accepts update requests on this interface
    #[serde(default = "default_true")]
    pub update_enabled: bool,
    /// Node forwards diagnostic traffic to and from this interface
    #[serde(default)]
    pub routing_enabled: bool,
}

fn default_true() -> bool {
    true
}

/// A node (ECU) of the system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Device definition name
    pub device_type: String,
    pub flashloader: FlashloaderKind,
    #[serde(default)]
    pub interfaces: Vec<NodeInterface>,
}

impl Node {
    /// Interface of this node on the given bus
    pub fn interface_on(&self, bus_index: usize) -> Option<&NodeInterface> {
        self.interfaces.iter().find(|i| i.bus_index == bus_index)
    }

    pub fn is_updatable(&self) -> bool {
        self.flashloader != FlashloaderKind::None
    }
}

/// One router on the way to a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteHop {
    /// Index of the routing node
    pub router: usize,
    /// Bus the router is addressed on
    pub in_bus: usize,
    /// Bus the router forwards to
    pub out_bus: usize,
}

/// Path from the active bus to a node
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Route {
    pub hops: Vec<RouteHop>,
    pub target_bus: usize,
}

impl Route {
    pub fn is_direct(&self) -> bool {
        self.hops.is_empty()
    }

    /// Router node indices in the order they have to be activated
    pub fn routers(&self) -> impl Iterator<Item = usize> + '_ {
        self.hops.iter().map(|hop| hop.router)
    }
}

/// Complete system definition
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SystemDefinition {
    pub name: String,
    #[serde(default)]
    pub buses: Vec<Bus>,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl SystemDefinition {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    pub fn bus(&self, index: usize) -> Option<&Bus> {
        self.buses.get(index)
    }

    pub fn node_index(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    /// Check structural consistency
    ///
    /// Node names double as folder names inside update packages, so they are
    /// restricted to ASCII letters, digits, `_` and `-`.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();

        for node in &self.nodes {
            if node.name.is_empty()
                || !node
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(SystemError::Invalid(format!(
                    "invalid node name '{}'",
                    node.name
                )));
            }

            if !names.insert(node.name.as_str()) {
                return Err(SystemError::Invalid(format!(
                    "duplicate node name '{}'",
                    node.name
                )));
            }

            let mut buses = HashSet::new();
            for interface in &node.interfaces {
                if interface.bus_index >= self.buses.len() {
                    return Err(SystemError::Invalid(format!(
                        "node '{}' references bus {} but only {} buses exist",
                        node.name,
                        interface.bus_index,
                        self.buses.len()
                    )));
                }
                if !buses.insert(interface.bus_index) {
                    return Err(SystemError::Invalid(format!(
                        "node '{}' has two interfaces on bus {}",
                        node.name, interface.bus_index
                    )));
                }
            }
        }

        Ok(())
    }

    /// Compute the route from `from_bus` to the node at `target`
    ///
    /// Breadth-first over buses, so the route with the fewest routers wins. Only
    /// modern-family nodes with routing enabled on both interfaces act as routers.
    pub fn route_to(&self, target: usize, from_bus: usize) -> Result<Route> {
        let node = self
            .nodes
            .get(target)
            .ok_or_else(|| SystemError::Invalid(format!("node index {} out of range", target)))?;

        if from_bus >= self.buses.len() {
            return Err(SystemError::Invalid(format!(
                "bus index {} out of range",
                from_bus
            )));
        }

        let reachable_on = |bus: usize| node.interface_on(bus).is_some_and(|i| i.update_enabled);

        let mut previous: Vec<Option<RouteHop>> = vec![None; self.buses.len()];
        let mut visited = vec![false; self.buses.len()];
        let mut queue = VecDeque::new();
        visited[from_bus] = true;
        queue.push_back(from_bus);

        while let Some(bus) = queue.pop_front() {
            if reachable_on(bus) {
                let mut hops = Vec::new();
                let mut current = bus;
                while let Some(hop) = previous[current] {
                    hops.push(hop);
                    current = hop.in_bus;
                }
                hops.reverse();
                return Ok(Route {
                    hops,
                    target_bus: bus,
                });
            }

            for (router_index, router) in self.nodes.iter().enumerate() {
                if router_index == target || router.flashloader != FlashloaderKind::Modern {
                    continue;
                }

                let enters_here = router
                    .interface_on(bus)
                    .is_some_and(|i| i.routing_enabled && i.update_enabled);
                if !enters_here {
                    continue;
                }

                for outgoing in router.interfaces.iter().filter(|i| i.routing_enabled) {
                    if outgoing.bus_index == bus || visited[outgoing.bus_index] {
                        continue;
                    }
                    visited[outgoing.bus_index] = true;
                    previous[outgoing.bus_index] = Some(RouteHop {
                        router: router_index,
                        in_bus: bus,
                        out_bus: outgoing.bus_index,
                    });
                    queue.push_back(outgoing.bus_index);
                }
            }
        }

        Err(SystemError::Unreachable {
            node: node.name.clone(),
            bus: from_bus,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interface(bus_index: usize, node_id: u8, routing: bool) -> NodeInterface {
        NodeInterface {
            bus_index,
            node_id,
            ip_address: None,
            update_enabled: true,
            routing_enabled: routing,
        }
    }

    fn bus(name: &str, kind: BusKind, bus_id: u8) -> Bus {
        Bus {
            name: name.into(),
            kind,
            bus_id,
            bitrate_kbps: None,
        }
    }

    /// Eth0 -- Gateway -- Can1 -- Router2 -- Can2
    fn routed_system() -> SystemDefinition {
        SystemDefinition {
            name: "routed".into(),
            buses: vec![
                bus("Eth0", BusKind::Ethernet, 0),
                bus("Can1", BusKind::Can, 1),
                bus("Can2", BusKind::Can, 2),
            ],
            nodes: vec![
                Node {
                    name: "Gateway".into(),
                    device_type: "GW".into(),
                    flashloader: FlashloaderKind::Modern,
                    interfaces: vec![interface(0, 1, true), interface(1, 1, true)],
                },
                Node {
                    name: "Router2".into(),
                    device_type: "GW".into(),
                    flashloader: FlashloaderKind::Modern,
                    interfaces: vec![interface(1, 2, true), interface(2, 2, true)],
                },
                Node {
                    name: "Leaf".into(),
                    device_type: "IO".into(),
                    flashloader: FlashloaderKind::Legacy,
                    interfaces: vec![interface(2, 5, false)],
                },
                Node {
                    name: "Island".into(),
                    device_type: "IO".into(),
                    flashloader: FlashloaderKind::Modern,
                    interfaces: vec![],
                },
            ],
        }
    }

    #[test]
    fn test_direct_route() {
        let system = routed_system();
        let route = system.route_to(0, 0).unwrap();
        assert!(route.is_direct());
        assert_eq!(route.target_bus, 0);
    }

    #[test]
    fn test_two_hop_route() {
        let system = routed_system();
        let route = system.route_to(2, 0).unwrap();
        assert_eq!(route.routers().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(route.target_bus, 2);
        assert_eq!(route.hops[0].in_bus, 0);
        assert_eq!(route.hops[1].out_bus, 2);
    }

    #[test]
    fn test_unreachable_node() {
        let system = routed_system();
        let result = system.route_to(3, 0);
        assert!(matches!(result, Err(SystemError::Unreachable { .. })));
    }

    #[test]
    fn test_legacy_nodes_do_not_route() {
        let mut system = routed_system();
        system.nodes[1].flashloader = FlashloaderKind::Legacy;
        assert!(system.route_to(2, 0).is_err());
    }

    #[test]
    fn test_validate_duplicate_names() {
        let mut system = routed_system();
        system.nodes[1].name = "Gateway".into();
        assert!(system.validate().is_err());
    }

    #[test]
    fn test_validate_bad_bus_index() {
        let mut system = routed_system();
        system.nodes[2].interfaces[0].bus_index = 9;
        assert!(system.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_path_like_names() {
        let mut system = routed_system();
        system.nodes[0].name = "../escape".into();
        assert!(system.validate().is_err());
        system.nodes[0].name = "Gateway".into();
        assert!(system.validate().is_ok());
    }
}
