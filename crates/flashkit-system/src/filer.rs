//! Reading and writing system definitions

use std::path::Path;
use tracing::debug;

use crate::definition::SystemDefinition;
use crate::{Result, SystemError};

/// Default file name of a serialized system definition
pub const SYSTEM_DEFINITION_FILE_NAME: &str = "system_definition.toml";

/// Persists a system definition
///
/// Packaging only needs to put the definition into the staging area and get it
/// back after extraction; the format is up to the implementation.
pub trait SystemDefinitionFiler {
    /// File name used inside packages
    fn file_name(&self) -> &str {
        SYSTEM_DEFINITION_FILE_NAME
    }

    fn save(&self, system: &SystemDefinition, path: &Path) -> Result<()>;

    fn load(&self, path: &Path) -> Result<SystemDefinition>;
}

/// TOML based system definition filer
#[derive(Debug, Clone, Copy, Default)]
pub struct TomlSystemDefinitionFiler;

impl SystemDefinitionFiler for TomlSystemDefinitionFiler {
    fn save(&self, system: &SystemDefinition, path: &Path) -> Result<()> {
        system.validate()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(system)?;
        std::fs::write(path, content)?;
        debug!("Wrote system definition {} to {}", system.name, path.display());
        Ok(())
    }

    fn load(&self, path: &Path) -> Result<SystemDefinition> {
        if !path.exists() {
            return Err(SystemError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)?;
        let system: SystemDefinition = toml::from_str(&content)?;
        system.validate()?;
        Ok(system)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{Bus, BusKind, FlashloaderKind, Node, NodeInterface};

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SYSTEM_DEFINITION_FILE_NAME);

        let system = SystemDefinition {
            name: "bench".into(),
            buses: vec![Bus {
                name: "Can0".into(),
                kind: BusKind::Can,
                bus_id: 0,
                bitrate_kbps: Some(500),
            }],
            nodes: vec![Node {
                name: "Ecu1".into(),
                device_type: "ECU_A".into(),
                flashloader: FlashloaderKind::Modern,
                interfaces: vec![NodeInterface {
                    bus_index: 0,
                    node_id: 3,
                    ip_address: None,
                    update_enabled: true,
                    routing_enabled: false,
                }],
            }],
        };

        let filer = TomlSystemDefinitionFiler;
        filer.save(&system, &path).unwrap();
        assert_eq!(filer.load(&path).unwrap(), system);
    }

    #[test]
    fn test_load_applies_interface_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sys.toml");
        std::fs::write(
            &path,
            r#"
name = "minimal"

[[buses]]
name = "Eth"
kind = "ethernet"
bus_id = 1

[[nodes]]
name = "Gw"
device_type = "GW"
flashloader = "modern"

[[nodes.interfaces]]
bus_index = 0
node_id = 1
ip_address = [192, 168, 0, 10]
"#,
        )
        .unwrap();

        let system = TomlSystemDefinitionFiler.load(&path).unwrap();
        let interface = &system.nodes[0].interfaces[0];
        assert!(interface.update_enabled);
        assert!(!interface.routing_enabled);
        assert_eq!(interface.ip_address, Some([192, 168, 0, 10]));
    }

    #[test]
    fn test_load_missing_file() {
        let result = TomlSystemDefinitionFiler.load(Path::new("/nonexistent/system.toml"));
        assert!(matches!(result, Err(SystemError::NotFound(_))));
    }
}
