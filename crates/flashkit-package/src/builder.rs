//! Package creation

use flashkit_config::PackageConfig;
use flashkit_crypto::{Digest, FileSet, PrivateKey, digest_files, encrypt_file, sign};
use flashkit_system::{
    DeviceRegistry, FlashJob, SystemDefinition, SystemDefinitionFiler, TomlSystemDefinitionFiler,
};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::archive::{collect_files, create_zip_with_level};
use crate::manifest::{NodeContent, NodeFiles, NodeSubManifest, PackageManifest, PackageNode};
use crate::security::SecurityOptions;
use crate::{
    NODE_ARCHIVE_EXTENSION, NODE_MANIFEST_FILE_NAME, NODE_SIGNATURE_FILE_NAME, PACKAGE_EXTENSION,
    PACKAGE_MANIFEST_FILE_NAME, PACKAGE_SIGNATURE_FILE_NAME, PackageError,
};

/// Everything needed to build one package
#[derive(Debug, Clone)]
pub struct PackageBuildRequest<'a> {
    /// Package file to create (must not exist, must end with `.sup`)
    pub target: PathBuf,
    pub system: &'a SystemDefinition,
    pub devices: &'a DeviceRegistry,
    pub active_bus_index: usize,
    /// One flag per node of the system definition
    pub active_nodes: Vec<bool>,
    /// Node indices in update order
    pub update_order: Vec<usize>,
    /// One job per node of the system definition
    pub jobs: Vec<FlashJob>,
    pub security: SecurityOptions,
    pub file_version: u32,
}

/// Outcome of a successful build
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub file_version: u32,
    /// Per node content digest (version 2)
    pub node_digests: Vec<Option<Digest>>,
    /// Whole package digest (version 1)
    pub package_digest: Option<Digest>,
    pub warnings: Vec<String>,
}

/// Builds update packages
pub struct PackageBuilder<F: SystemDefinitionFiler = TomlSystemDefinitionFiler> {
    config: PackageConfig,
    filer: F,
}

impl PackageBuilder<TomlSystemDefinitionFiler> {
    pub fn new(config: PackageConfig) -> Self {
        Self {
            config,
            filer: TomlSystemDefinitionFiler,
        }
    }
}

impl<F: SystemDefinitionFiler> PackageBuilder<F> {
    pub fn with_filer(config: PackageConfig, filer: F) -> Self {
        Self { config, filer }
    }

    /// Build the package described by `request`
    ///
    /// All preconditions are checked before anything is written. Staging happens
    /// in a temporary directory that is removed on every exit path.
    pub fn build(&self, request: &PackageBuildRequest<'_>) -> Result<BuildReport, PackageError> {
        let mut report = BuildReport {
            file_version: request.file_version,
            node_digests: vec![None; request.system.nodes.len()],
            ..BuildReport::default()
        };

        validate_request(request, &mut report.warnings)?;

        let staging = self.staging_dir()?;
        info!(
            "Building version {} package {} in {}",
            request.file_version,
            request.target.display(),
            staging.path().display()
        );

        let mut manifest = PackageManifest::new(request.file_version, request.active_bus_index);
        manifest.update_order = request.update_order.clone();

        for (index, node) in request.system.nodes.iter().enumerate() {
            let active = request.active_nodes[index];
            let job = &request.jobs[index];

            let content = if active && job.has_content() {
                let node_dir = staging.path().join(&node.name);
                let files = stage_node_files(job, &node_dir)?;
                match request.file_version {
                    1 => NodeContent::Inline(prefixed(&files, &node.name)),
                    _ => {
                        let digest = self.seal_node(
                            staging.path(),
                            &node.name,
                            files,
                            request.security.passphrase(index),
                            request.security.signing_key(index),
                        )?;
                        report.node_digests[index] = Some(digest);
                        NodeContent::SubPackage {
                            archive: format!("{}.{}", node.name, NODE_ARCHIVE_EXTENSION),
                            manifest: NODE_MANIFEST_FILE_NAME.to_string(),
                            signature_file: request
                                .security
                                .signing_key(index)
                                .map(|_| NODE_SIGNATURE_FILE_NAME.to_string()),
                        }
                    }
                }
            } else {
                NodeContent::None
            };

            manifest.nodes.push(PackageNode {
                name: node.name.clone(),
                active,
                content,
            });
        }

        self.filer
            .save(request.system, &staging.path().join(self.filer.file_name()))?;

        let device_types: BTreeSet<&str> = request
            .system
            .nodes
            .iter()
            .zip(&request.active_nodes)
            .filter(|(_, active)| **active)
            .map(|(node, _)| node.device_type.as_str())
            .collect();
        request.devices.export(staging.path(), device_types)?;

        manifest.save(&staging.path().join(PACKAGE_MANIFEST_FILE_NAME))?;

        if request.file_version == 1 {
            report.package_digest = Some(sign_package(staging.path(), &request.security)?);
        }

        let files = collect_files(staging.path())?;
        if let Err(e) = create_zip_with_level(
            staging.path(),
            &files,
            &request.target,
            self.config.compression_level,
        ) {
            fs::remove_file(&request.target).ok();
            return Err(e.into());
        }

        for warning in &report.warnings {
            warn!("{}", warning);
        }
        info!(
            "Created {} with {} entries",
            request.target.display(),
            files.len()
        );
        Ok(report)
    }

    fn staging_dir(&self) -> Result<TempDir, PackageError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("flashkit-package-");
        let dir = match &self.config.staging_dir {
            Some(parent) => {
                fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    /// Turn a staged node folder into its (signed, encrypted) sub-archive
    fn seal_node(
        &self,
        staging: &Path,
        node_name: &str,
        files: NodeFiles,
        passphrase: Option<&str>,
        signing_key: Option<&PathBuf>,
    ) -> Result<Digest, PackageError> {
        let node_dir = staging.join(node_name);

        let mut sub_manifest = NodeSubManifest::new(files);
        if signing_key.is_some() {
            sub_manifest.signature_file = Some(NODE_SIGNATURE_FILE_NAME.to_string());
        }
        sub_manifest.save(&node_dir.join(NODE_MANIFEST_FILE_NAME))?;

        let mut protected = sub_manifest.files.file_set();
        protected.insert(NODE_MANIFEST_FILE_NAME);
        let digest = digest_files(&protected, Some(&node_dir))?;
        debug!("Node {} digest {}", node_name, digest);

        if let Some(key_path) = signing_key {
            let key = PrivateKey::load(key_path)?;
            let signature = sign(&digest, &key)?;
            fs::write(node_dir.join(NODE_SIGNATURE_FILE_NAME), signature.to_der()?)?;
            debug!("Signed node {} with {}", node_name, key_path.display());
        }

        let archive = staging.join(format!("{}.{}", node_name, NODE_ARCHIVE_EXTENSION));
        let entries = collect_files(&node_dir)?;
        create_zip_with_level(&node_dir, &entries, &archive, self.config.compression_level)?;

        if let Some(passphrase) = passphrase {
            encrypt_file(passphrase, &archive, &archive)?;
            debug!("Encrypted sub-archive of node {}", node_name);
        }

        fs::remove_dir_all(&node_dir)?;
        Ok(digest)
    }
}

fn validate_request(
    request: &PackageBuildRequest<'_>,
    warnings: &mut Vec<String>,
) -> Result<(), PackageError> {
    if request.target.exists() {
        return Err(PackageError::AlreadyExists(request.target.clone()));
    }

    let extension_ok = request
        .target
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(PACKAGE_EXTENSION));
    if !extension_ok {
        return Err(PackageError::WrongExtension(request.target.clone()));
    }

    if !matches!(request.file_version, 1 | 2) {
        return Err(crate::ManifestError::UnsupportedFormat(request.file_version).into());
    }

    let node_count = request.system.nodes.len();
    if request.active_nodes.len() != node_count {
        return Err(PackageError::ActiveNodeCountMismatch {
            flags: request.active_nodes.len(),
            nodes: node_count,
        });
    }

    if !request.active_nodes.iter().any(|active| *active) {
        return Err(PackageError::NoActiveNode);
    }

    if request.update_order.is_empty() {
        return Err(PackageError::EmptyUpdateOrder);
    }

    if request.jobs.len() != node_count {
        return Err(PackageError::ConfigMismatch {
            what: "flash jobs".into(),
            len: request.jobs.len(),
            expected: node_count,
        });
    }

    if request.security.len() != node_count {
        return Err(PackageError::ConfigMismatch {
            what: "security settings".into(),
            len: request.security.len(),
            expected: node_count,
        });
    }

    if request.active_bus_index >= request.system.buses.len() {
        return Err(PackageError::Config(format!(
            "active bus index {} out of range",
            request.active_bus_index
        )));
    }

    request.system.validate()?;

    let mut seen = BTreeSet::new();
    for &index in &request.update_order {
        let node = request.system.nodes.get(index).ok_or_else(|| {
            PackageError::Config(format!("update order refers to unknown node {}", index))
        })?;
        if !seen.insert(index) {
            return Err(PackageError::Config(format!(
                "node {} appears twice in the update order",
                node.name
            )));
        }
        if !request.active_nodes[index] {
            return Err(PackageError::Config(format!(
                "node {} is in the update order but not active",
                node.name
            )));
        }
        if !request.jobs[index].has_content() {
            return Err(PackageError::Config(format!(
                "node {} is in the update order but has nothing to update",
                node.name
            )));
        }
    }

    for (index, node) in request.system.nodes.iter().enumerate() {
        if !request.active_nodes[index] {
            continue;
        }

        if request.devices.find(&node.device_type).is_none() {
            return Err(PackageError::Config(format!(
                "node {} uses unknown device type {}",
                node.name, node.device_type
            )));
        }

        let job = &request.jobs[index];
        if job.has_content() && !seen.contains(&index) {
            warnings.push(format!(
                "Node {} has files but no update position; it will not be updated",
                node.name
            ));
        }

        let mut names = BTreeSet::new();
        for file in job.files() {
            if !file.is_file() {
                return Err(PackageError::MissingFile(file.clone()));
            }
            let name = file_name(file)?;
            if !names.insert(name.clone()) {
                return Err(PackageError::Config(format!(
                    "node {} has two files named {}",
                    node.name, name
                )));
            }
        }
    }

    if request.file_version == 1 {
        if request.security.any_encryption() {
            return Err(PackageError::Config(
                "version 1 packages can not be encrypted".into(),
            ));
        }

        let keys: BTreeSet<&PathBuf> = (0..node_count)
            .filter_map(|i| request.security.signing_key(i))
            .collect();
        if keys.len() > 1 {
            return Err(PackageError::Config(
                "version 1 packages are signed as a whole and take a single key".into(),
            ));
        }
    }

    Ok(())
}

fn file_name(path: &Path) -> Result<String, PackageError> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| PackageError::Config(format!("{} has no file name", path.display())))
}

/// Copy the job's files into `node_dir`; returns the lists relative to it
fn stage_node_files(job: &FlashJob, node_dir: &Path) -> Result<NodeFiles, PackageError> {
    fs::create_dir_all(node_dir)?;

    let copy = |source: &PathBuf| -> Result<String, PackageError> {
        let name = file_name(source)?;
        fs::copy(source, node_dir.join(&name))?;
        Ok(name)
    };

    Ok(NodeFiles {
        application_files: job.application_files.iter().map(copy).collect::<Result<_, _>>()?,
        nvm_files: job.nvm_files.iter().map(copy).collect::<Result<_, _>>()?,
        pem_file: job.pem_file.as_ref().map(copy).transpose()?,
        send_security_state: job.send_security_state,
        security_enabled: job.security_enabled,
        send_debugger_state: job.send_debugger_state,
        debugger_enabled: job.debugger_enabled,
        other_accepted_names: job.other_accepted_names.clone(),
    })
}

fn prefixed(files: &NodeFiles, folder: &str) -> NodeFiles {
    let prefix = |name: &String| format!("{}/{}", folder, name);
    NodeFiles {
        application_files: files.application_files.iter().map(prefix).collect(),
        nvm_files: files.nvm_files.iter().map(prefix).collect(),
        pem_file: files.pem_file.as_ref().map(prefix),
        ..files.clone()
    }
}

/// Digest the whole staging tree and sign it with the package key, if any
fn sign_package(staging: &Path, security: &SecurityOptions) -> Result<Digest, PackageError> {
    let files: FileSet = collect_files(staging)?;
    let digest = digest_files(&files, Some(staging))?;

    let key = (0..security.len()).find_map(|i| security.signing_key(i));
    if let Some(key_path) = key {
        let key = PrivateKey::load(key_path)?;
        let signature = sign(&digest, &key)?;
        fs::write(staging.join(PACKAGE_SIGNATURE_FILE_NAME), signature.to_der()?)?;
        info!("Signed package with {}", key_path.display());
    }

    Ok(digest)
}
