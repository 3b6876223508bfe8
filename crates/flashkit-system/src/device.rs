//! Device definitions and the device INI index
//!
//! A device definition describes one hardware type: its name as reported by the
//! flashloader, the transfer mode it expects and how long it needs to come back
//! after a reset. Definitions are stored as TOML files and indexed by a section
//! based `devices.ini`:
//!
//! ```ini
//! [DeviceTypes]
//! NumTypes=1
//! TypeName1=Modern
//!
//! [Modern]
//! NumDevices=1
//! Device1=Modern/ECU_A.devdef
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::definition::BusKind;
use crate::ini::IniDocument;
use crate::{Result, SystemError};

/// File extension of device definition files
pub const DEVICE_DEFINITION_EXTENSION: &str = "devdef";

/// Folder receiving exported device definitions
pub const DEVICE_DEFINITION_FOLDER: &str = "device_definitions";

/// Name of the device index file
pub const DEVICE_INI_FILE_NAME: &str = "devices.ini";

const TYPES_SECTION: &str = "DeviceTypes";

/// Minimum waits after a node reset, per bus kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetWaitTimes {
    #[serde(default = "default_no_change")]
    pub can_no_change_ms: u64,
    #[serde(default = "default_fundamental")]
    pub can_fundamental_ms: u64,
    #[serde(default = "default_no_change")]
    pub ethernet_no_change_ms: u64,
    #[serde(default = "default_fundamental")]
    pub ethernet_fundamental_ms: u64,
}

fn default_no_change() -> u64 {
    1000
}

fn default_fundamental() -> u64 {
    5000
}

impl Default for ResetWaitTimes {
    fn default() -> Self {
        Self {
            can_no_change_ms: default_no_change(),
            can_fundamental_ms: default_fundamental(),
            ethernet_no_change_ms: default_no_change(),
            ethernet_fundamental_ms: default_fundamental(),
        }
    }
}

impl ResetWaitTimes {
    /// Wait after a reset; `fundamental` applies when the node changed its
    /// communication setup (new application, new addressing)
    pub fn for_bus(&self, kind: BusKind, fundamental: bool) -> Duration {
        let ms = match (kind, fundamental) {
            (BusKind::Can, false) => self.can_no_change_ms,
            (BusKind::Can, true) => self.can_fundamental_ms,
            (BusKind::Ethernet, false) => self.ethernet_no_change_ms,
            (BusKind::Ethernet, true) => self.ethernet_fundamental_ms,
        };
        Duration::from_millis(ms)
    }
}

/// Description of one device type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Name reported by the flashloader
    pub device_name: String,

    /// Further names accepted for this type
    #[serde(default)]
    pub other_accepted_names: BTreeSet<String>,

    /// Applications are transferred as files instead of hex images
    #[serde(default)]
    pub file_based_transfer: bool,

    /// Flashloader can route to other buses
    #[serde(default)]
    pub routing_supported: bool,

    #[serde(default)]
    pub reset_wait: ResetWaitTimes,
}

impl DeviceDefinition {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            other_accepted_names: BTreeSet::new(),
            file_based_transfer: false,
            routing_supported: false,
            reset_wait: ResetWaitTimes::default(),
        }
    }

    pub fn accepts_name(&self, name: &str) -> bool {
        self.device_name == name || self.other_accepted_names.contains(name)
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SystemError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let definition: DeviceDefinition = toml::from_str(&content)?;
        Ok(definition)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// A registered definition with its source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    /// Type group the definition is listed under in the INI
    pub group: String,
    pub definition: DeviceDefinition,
    pub path: PathBuf,
}

/// All known device definitions
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    entries: Vec<DeviceEntry>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load all definitions listed in a device INI; paths are relative to the INI
    pub fn load_ini(ini_path: &Path) -> Result<Self> {
        let ini = IniDocument::load(ini_path)?;
        let base = ini_path.parent().unwrap_or_else(|| Path::new("."));
        let mut registry = Self::new();

        let type_count: usize = ini.require(TYPES_SECTION, "NumTypes")?;
        for type_index in 1..=type_count {
            let group: String = ini.require(TYPES_SECTION, &format!("TypeName{}", type_index))?;
            let device_count: usize = ini.require(&group, "NumDevices")?;

            for device_index in 1..=device_count {
                let relative: String = ini.require(&group, &format!("Device{}", device_index))?;
                let path = base.join(&relative);
                let definition = DeviceDefinition::load(&path)?;
                debug!("Loaded device definition {} from {}", definition.device_name, relative);
                registry.entries.push(DeviceEntry {
                    group: group.clone(),
                    definition,
                    path,
                });
            }
        }

        info!(
            "Loaded {} device definitions from {}",
            registry.entries.len(),
            ini_path.display()
        );
        Ok(registry)
    }

    pub fn register(&mut self, group: &str, definition: DeviceDefinition, path: PathBuf) {
        self.entries.push(DeviceEntry {
            group: group.to_string(),
            definition,
            path,
        });
    }

    /// Find the definition for a device type name (main or other accepted name)
    pub fn find(&self, device_type: &str) -> Option<&DeviceEntry> {
        self.entries
            .iter()
            .find(|e| e.definition.device_name == device_type)
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|e| e.definition.accepts_name(device_type))
            })
    }

    pub fn entries(&self) -> &[DeviceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy the definitions for `device_types` below `target_dir` and write the
    /// matching device INI there
    ///
    /// Returns the path of the written INI.
    pub fn export<'a>(
        &self,
        target_dir: &Path,
        device_types: impl IntoIterator<Item = &'a str>,
    ) -> Result<PathBuf> {
        let wanted: BTreeSet<&str> = device_types.into_iter().collect();
        let mut groups: Vec<(String, Vec<String>)> = Vec::new();

        for device_type in wanted {
            let entry = self
                .find(device_type)
                .ok_or_else(|| SystemError::UnknownDeviceType(device_type.to_string()))?;

            let file_name = entry
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| {
                    format!("{}.{}", entry.definition.device_name, DEVICE_DEFINITION_EXTENSION)
                });
            let relative = format!("{}/{}/{}", DEVICE_DEFINITION_FOLDER, entry.group, file_name);
            let destination = target_dir.join(&relative);

            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if entry.path.exists() {
                std::fs::copy(&entry.path, &destination)?;
            } else {
                entry.definition.save(&destination)?;
            }

            match groups.iter_mut().find(|(name, _)| *name == entry.group) {
                Some((_, files)) => {
                    if !files.contains(&relative) {
                        files.push(relative);
                    }
                }
                None => groups.push((entry.group.clone(), vec![relative])),
            }
        }

        let mut ini = IniDocument::new();
        ini.set(TYPES_SECTION, "NumTypes", groups.len().to_string());
        for (index, (group, _)) in groups.iter().enumerate() {
            ini.set(TYPES_SECTION, &format!("TypeName{}", index + 1), group.as_str());
        }
        for (group, files) in &groups {
            ini.set(group, "NumDevices", files.len().to_string());
            for (index, file) in files.iter().enumerate() {
                ini.set(group, &format!("Device{}", index + 1), file.as_str());
            }
        }

        let ini_path = target_dir.join(DEVICE_INI_FILE_NAME);
        ini.save(&ini_path)?;
        Ok(ini_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_in(dir: &Path) -> DeviceRegistry {
        let mut registry = DeviceRegistry::new();

        let mut modern = DeviceDefinition::new("ECU_A");
        modern.other_accepted_names.insert("ECU_A_REV2".into());
        modern.routing_supported = true;
        let modern_path = dir.join("src/ECU_A.devdef");
        modern.save(&modern_path).unwrap();
        registry.register("Modern", modern, modern_path);

        let legacy = DeviceDefinition::new("IO_B");
        let legacy_path = dir.join("src/IO_B.devdef");
        legacy.save(&legacy_path).unwrap();
        registry.register("Legacy", legacy, legacy_path);

        registry
    }

    #[test]
    fn test_reset_wait_selection() {
        let waits = ResetWaitTimes {
            can_no_change_ms: 10,
            can_fundamental_ms: 20,
            ethernet_no_change_ms: 30,
            ethernet_fundamental_ms: 40,
        };
        assert_eq!(waits.for_bus(BusKind::Can, true), Duration::from_millis(20));
        assert_eq!(waits.for_bus(BusKind::Ethernet, false), Duration::from_millis(30));
    }

    #[test]
    fn test_definition_defaults_from_minimal_toml() {
        let definition: DeviceDefinition = toml::from_str("device_name = \"X\"").unwrap();
        assert_eq!(definition.reset_wait, ResetWaitTimes::default());
        assert!(!definition.file_based_transfer);
    }

    #[test]
    fn test_find_by_other_accepted_name() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());

        assert_eq!(registry.find("ECU_A_REV2").unwrap().definition.device_name, "ECU_A");
        assert!(registry.find("UNKNOWN").is_none());
    }

    #[test]
    fn test_export_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        let target = dir.path().join("package");

        let ini_path = registry.export(&target, ["IO_B", "ECU_A", "ECU_A"]).unwrap();
        assert!(target.join("device_definitions/Modern/ECU_A.devdef").exists());
        assert!(target.join("device_definitions/Legacy/IO_B.devdef").exists());

        let reloaded = DeviceRegistry::load_ini(&ini_path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.find("ECU_A").unwrap().definition.routing_supported);
    }

    #[test]
    fn test_export_only_used_types() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        let target = dir.path().join("package");

        let ini_path = registry.export(&target, ["IO_B"]).unwrap();
        let reloaded = DeviceRegistry::load_ini(&ini_path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert!(!target.join("device_definitions/Modern").exists());
    }

    #[test]
    fn test_export_unknown_type() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        let result = registry.export(&dir.path().join("out"), ["NOPE"]);
        assert!(matches!(result, Err(SystemError::UnknownDeviceType(_))));
    }
}
