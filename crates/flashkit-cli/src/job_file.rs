//! Package job description read by `flashkit create`
//!
//! ```toml
//! system = "system_definition.toml"
//! devices = "devices/devices.ini"
//! active_bus = 0
//! update_order = ["Engine", "Door"]
//!
//! [[node]]
//! name = "Engine"
//! applications = ["engine.hex"]
//! security_state = true
//! passphrase = "secret"
//! signing_key = "keys/engine.pem"
//! ```
//!
//! Listed nodes are active. Relative paths are resolved against the directory
//! of the job file.

use anyhow::{Context, Result, bail};
use flashkit_package::{PerNodeSecurityConfig, SecurityOptions};
use flashkit_system::{
    DeviceRegistry, FlashJob, SystemDefinition, SystemDefinitionFiler, TomlSystemDefinitionFiler,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
pub struct PackageJobFile {
    pub system: PathBuf,
    pub devices: PathBuf,

    #[serde(default)]
    pub active_bus: usize,

    /// Overrides the configured package format version
    #[serde(default)]
    pub file_version: Option<u32>,

    /// Node names; defaults to the order of the `[[node]]` tables
    #[serde(default)]
    pub update_order: Vec<String>,

    #[serde(default, rename = "node")]
    pub nodes: Vec<NodeJob>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NodeJob {
    pub name: String,
    #[serde(default)]
    pub applications: Vec<PathBuf>,
    #[serde(default)]
    pub nvm: Vec<PathBuf>,
    #[serde(default)]
    pub pem: Option<PathBuf>,
    #[serde(default)]
    pub security_state: Option<bool>,
    #[serde(default)]
    pub debugger_state: Option<bool>,
    #[serde(default)]
    pub accepted_names: Vec<String>,
    /// Empty or missing leaves the node archive unencrypted
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub signing_key: Option<PathBuf>,
}

/// Everything a package build needs, with node names resolved to indices
#[derive(Debug)]
pub struct ResolvedJobs {
    pub system: SystemDefinition,
    pub devices: DeviceRegistry,
    pub active_bus: usize,
    pub active_nodes: Vec<bool>,
    pub update_order: Vec<usize>,
    pub jobs: Vec<FlashJob>,
    pub security: SecurityOptions,
    pub file_version: Option<u32>,
}

impl PackageJobFile {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read job file {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("Invalid job file {}", path.display()))
    }

    /// Load the referenced system and device definitions and build the per node lists
    pub fn resolve(&self, base: &Path) -> Result<ResolvedJobs> {
        let system_path = resolve_path(base, &self.system);
        let system = TomlSystemDefinitionFiler
            .load(&system_path)
            .with_context(|| {
                format!("Failed to load system definition {}", system_path.display())
            })?;

        let devices_path = resolve_path(base, &self.devices);
        let devices = DeviceRegistry::load_ini(&devices_path)
            .with_context(|| format!("Failed to load device index {}", devices_path.display()))?;

        let node_count = system.node_count();
        let mut active_nodes = vec![false; node_count];
        let mut jobs = vec![FlashJob::new(); node_count];
        let mut security = vec![None; node_count];

        for node in &self.nodes {
            let index = node_index(&system, &node.name)?;
            if active_nodes[index] {
                bail!("Node {} is listed twice", node.name);
            }
            active_nodes[index] = true;
            jobs[index] = node.flash_job(base);

            let config = PerNodeSecurityConfig {
                passphrase: node.passphrase.clone().filter(|p| !p.is_empty()),
                signing_key: node
                    .signing_key
                    .as_ref()
                    .filter(|k| !k.as_os_str().is_empty())
                    .map(|k| resolve_path(base, k)),
            };
            security[index] = (!config.is_empty()).then_some(config);
        }

        let update_order = if self.update_order.is_empty() {
            self.nodes
                .iter()
                .map(|n| node_index(&system, &n.name))
                .collect::<Result<Vec<_>>>()?
        } else {
            self.update_order
                .iter()
                .map(|name| node_index(&system, name))
                .collect::<Result<Vec<_>>>()?
        };

        Ok(ResolvedJobs {
            system,
            devices,
            active_bus: self.active_bus,
            active_nodes,
            update_order,
            jobs,
            security: SecurityOptions::from_nodes(security),
            file_version: self.file_version,
        })
    }
}

impl NodeJob {
    fn flash_job(&self, base: &Path) -> FlashJob {
        let mut job = FlashJob::new();
        for path in &self.applications {
            job = job.with_application(resolve_path(base, path));
        }
        for path in &self.nvm {
            job = job.with_nvm(resolve_path(base, path));
        }
        if let Some(pem) = &self.pem {
            job = job.with_pem(resolve_path(base, pem));
        }
        if let Some(enabled) = self.security_state {
            job = job.with_security_state(enabled);
        }
        if let Some(enabled) = self.debugger_state {
            job = job.with_debugger_state(enabled);
        }
        for name in &self.accepted_names {
            job = job.accept_name(name.as_str());
        }
        job
    }
}

fn node_index(system: &SystemDefinition, name: &str) -> Result<usize> {
    system
        .node_index(name)
        .with_context(|| format!("Node {} is not part of system {}", name, system.name))
}

fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
