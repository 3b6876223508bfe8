//! Package unpacking and verification

use flashkit_crypto::{FileSet, PublicKey, decrypt_file, digest_files, verify_der};
use flashkit_system::{
    DEVICE_INI_FILE_NAME, DeviceRegistry, FlashJob, SystemDefinition, SystemDefinitionFiler,
    TomlSystemDefinitionFiler,
};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::archive::{collect_files, extract_zip, is_zip};
use crate::manifest::{NodeContent, NodeSubManifest, PackageManifest};
use crate::security::expand_per_node;
use crate::{
    NODE_SIGNATURE_FILE_NAME, PACKAGE_MANIFEST_FILE_NAME, PACKAGE_SIGNATURE_FILE_NAME,
    PackageError,
};

/// Inputs for loading a package
#[derive(Debug, Clone, Default)]
pub struct PackageLoadRequest {
    /// Package file or an already extracted package directory
    pub package: PathBuf,
    /// Extraction target for package files; cleared before use
    pub target_dir: PathBuf,
    /// Node passphrases (0/1/N); an empty passphrase means "not encrypted"
    pub passphrases: Vec<String>,
    /// Node certificates (0/1/N); an empty path means "no certificate"
    pub certificates: Vec<PathBuf>,
}

/// Unpacked package content
#[derive(Debug, Clone)]
pub struct LoadedPackage {
    /// Folder holding the package manifest
    pub root: PathBuf,
    pub file_version: u32,
    pub system: SystemDefinition,
    pub devices: DeviceRegistry,
    pub active_bus_index: usize,
    pub active_nodes: Vec<bool>,
    pub update_order: Vec<usize>,
    /// One job per node with absolute paths
    pub jobs: Vec<FlashJob>,
    pub warnings: Vec<String>,
}

/// Unpacks and verifies update packages
pub struct PackageLoader<F: SystemDefinitionFiler = TomlSystemDefinitionFiler> {
    filer: F,
}

impl Default for PackageLoader<TomlSystemDefinitionFiler> {
    fn default() -> Self {
        Self::new()
    }
}

impl PackageLoader<TomlSystemDefinitionFiler> {
    pub fn new() -> Self {
        Self {
            filer: TomlSystemDefinitionFiler,
        }
    }
}

impl<F: SystemDefinitionFiler> PackageLoader<F> {
    pub fn with_filer(filer: F) -> Self {
        Self { filer }
    }

    /// Unpack the package, verify all signatures and rebuild the flash jobs
    pub fn process(&self, request: &PackageLoadRequest) -> Result<LoadedPackage, PackageError> {
        let base = self.unpack(request)?;

        let manifest_path = find_unique(&base, PACKAGE_MANIFEST_FILE_NAME)?;
        let system_path = find_unique(&base, self.filer.file_name())?;
        let ini_path = find_unique(&base, DEVICE_INI_FILE_NAME)?;

        let root = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| base.clone());

        let manifest = PackageManifest::load(&manifest_path)?;
        let system = self.filer.load(&system_path)?;
        let devices = DeviceRegistry::load_ini(&ini_path)?;

        let node_count = system.nodes.len();
        if manifest.nodes.len() != node_count {
            return Err(PackageError::CorruptPackage(format!(
                "manifest lists {} nodes, system definition has {}",
                manifest.nodes.len(),
                node_count
            )));
        }
        if manifest.active_bus_index >= system.buses.len() {
            return Err(PackageError::CorruptPackage(format!(
                "active bus index {} out of range",
                manifest.active_bus_index
            )));
        }

        let passphrases = expand_per_node(&request.passphrases, node_count, "passphrases")?;
        let certificates = expand_per_node(&request.certificates, node_count, "certificates")?;
        let certificates: Vec<Option<PathBuf>> = certificates
            .into_iter()
            .map(|c| c.filter(|p| !p.as_os_str().is_empty()))
            .collect();

        let mut warnings = Vec::new();
        let jobs = match manifest.file_version {
            1 => self.load_v1(&root, &manifest, &certificates)?,
            _ => self.load_v2(
                &root,
                &manifest,
                &system,
                &passphrases,
                &certificates,
                &mut warnings,
            )?,
        };

        for index in manifest.unordered_nodes() {
            warnings.push(format!(
                "No update position found for active node {}; it will not be updated",
                manifest.nodes[index].name
            ));
        }
        for warning in &warnings {
            warn!("{}", warning);
        }

        info!(
            "Loaded version {} package with {} nodes ({} in update order)",
            manifest.file_version,
            node_count,
            manifest.update_order.len()
        );

        Ok(LoadedPackage {
            root,
            file_version: manifest.file_version,
            system,
            devices,
            active_bus_index: manifest.active_bus_index,
            active_nodes: manifest.active_flags(),
            update_order: manifest.update_order.clone(),
            jobs,
            warnings,
        })
    }

    /// Directory holding the package files
    fn unpack(&self, request: &PackageLoadRequest) -> Result<PathBuf, PackageError> {
        if request.package.is_dir() {
            return Ok(request.package.clone());
        }

        if !request.package.is_file() {
            return Err(PackageError::MissingFile(request.package.clone()));
        }
        if !is_zip(&request.package) {
            return Err(PackageError::CorruptPackage(format!(
                "{} is not a zip archive",
                request.package.display()
            )));
        }

        if request.target_dir.exists() {
            fs::remove_dir_all(&request.target_dir)?;
        }
        fs::create_dir_all(&request.target_dir)?;

        extract_zip(&request.package, &request.target_dir)?;
        Ok(request.target_dir.clone())
    }

    fn load_v1(
        &self,
        root: &Path,
        manifest: &PackageManifest,
        certificates: &[Option<PathBuf>],
    ) -> Result<Vec<FlashJob>, PackageError> {
        let signature_path = root.join(PACKAGE_SIGNATURE_FILE_NAME);
        if signature_path.exists() {
            let certificate = certificates
                .first()
                .cloned()
                .flatten()
                .ok_or_else(|| PackageError::MissingCertificate {
                    node: "package".into(),
                })?;
            let key = PublicKey::load_certificate(&certificate)?;

            let mut files = FileSet::new();
            for file in collect_files(root)?.iter() {
                if file != PACKAGE_SIGNATURE_FILE_NAME {
                    files.insert(file);
                }
            }

            let digest = digest_files(&files, Some(root))?;
            let signature = fs::read(&signature_path)?;
            if !verify_der(&key, &signature, &digest) {
                return Err(PackageError::InvalidSignature {
                    node: "package".into(),
                });
            }
            info!("Package signature verified");
        }

        Ok(manifest
            .nodes
            .iter()
            .map(|node| match (&node.content, node.active) {
                (NodeContent::Inline(files), true) => files.to_flash_job(root),
                _ => FlashJob::default(),
            })
            .collect())
    }

    fn load_v2(
        &self,
        root: &Path,
        manifest: &PackageManifest,
        system: &SystemDefinition,
        passphrases: &[Option<String>],
        certificates: &[Option<PathBuf>],
        warnings: &mut Vec<String>,
    ) -> Result<Vec<FlashJob>, PackageError> {
        let mut jobs = Vec::with_capacity(manifest.nodes.len());

        for (index, node) in manifest.nodes.iter().enumerate() {
            let (archive, sub_manifest, signed_as) = match (&node.content, node.active) {
                (
                    NodeContent::SubPackage {
                        archive,
                        manifest,
                        signature_file,
                    },
                    true,
                ) => (archive, manifest, signature_file),
                _ => {
                    jobs.push(FlashJob::default());
                    continue;
                }
            };

            let name = &system.nodes[index].name;
            let archive_path = root.join(archive);
            if !archive_path.is_file() {
                return Err(PackageError::CorruptPackage(format!(
                    "sub-archive {} of node {} missing",
                    archive, name
                )));
            }

            let node_dir = root.join(name);
            let passphrase = passphrases[index].as_deref().filter(|p| !p.is_empty());
            match passphrase {
                Some(passphrase) => {
                    let decrypted = root.join(format!("{}.decrypted", archive));
                    let result = decrypt_file(passphrase, &archive_path, &decrypted)
                        .map_err(PackageError::from)
                        .and_then(|_| {
                            extract_zip(&decrypted, &node_dir).map_err(PackageError::from)
                        });
                    fs::remove_file(&decrypted).ok();
                    result?;
                }
                None => {
                    if !is_zip(&archive_path) {
                        return Err(PackageError::Encrypted { node: name.clone() });
                    }
                    extract_zip(&archive_path, &node_dir)?;
                }
            }

            let sub = NodeSubManifest::load(&node_dir.join(sub_manifest))?;

            // A node flagged as signed in the package manifest must still carry
            // the same signature reference and file
            if let Some(expected) = signed_as {
                let present = node_dir.join(expected).is_file();
                if sub.signature_file.as_ref() != Some(expected) || !present {
                    warn!("Node {} lost its signature {}", name, expected);
                    return Err(PackageError::InvalidSignature { node: name.clone() });
                }
            }

            let signature_file = sub.signature_file.clone().or_else(|| {
                node_dir
                    .join(NODE_SIGNATURE_FILE_NAME)
                    .exists()
                    .then(|| NODE_SIGNATURE_FILE_NAME.to_string())
            });

            match signature_file {
                Some(signature_file) => {
                    let certificate = certificates[index].as_ref().ok_or_else(|| {
                        PackageError::MissingCertificate { node: name.clone() }
                    })?;
                    let key = PublicKey::load_certificate(certificate)?;

                    let mut protected = sub.files.file_set();
                    protected.insert(sub_manifest);
                    let digest = digest_files(&protected, Some(&node_dir))?;

                    let signature = fs::read(node_dir.join(&signature_file))?;
                    if !verify_der(&key, &signature, &digest) {
                        return Err(PackageError::InvalidSignature { node: name.clone() });
                    }
                    debug!("Signature of node {} verified", name);
                }
                None => {
                    if certificates[index].is_some() {
                        warnings.push(format!(
                            "Certificate given for node {} but its content is not signed",
                            name
                        ));
                    }
                }
            }

            jobs.push(sub.files.to_flash_job(&node_dir));
        }

        Ok(jobs)
    }
}

/// The single file named `name` below `base`
fn find_unique(base: &Path, name: &str) -> Result<PathBuf, PackageError> {
    let matches: Vec<PathBuf> = WalkDir::new(base)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && e.file_name() == name)
        .map(|e| e.into_path())
        .collect();

    match matches.len() {
        1 => Ok(matches.into_iter().next().unwrap_or_default()),
        count => Err(PackageError::CorruptPackage(format!(
            "expected exactly one {}, found {}",
            name, count
        ))),
    }
}
