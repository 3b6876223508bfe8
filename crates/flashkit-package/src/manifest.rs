//! Package and node manifests
//!
//! The package manifest names the format version, the active bus and, per node of
//! the system definition, the active flag and update position. Version 1 lists
//! the node files inline (relative to the package root); version 2 only refers to
//! the node's sub-archive, whose own manifest lists the files relative to the
//! node folder.
//!
//! ```xml
//! <secure-update-package>
//!   <file-version>2</file-version>
//!   <active-bus-index>0</active-bus-index>
//!   <nodes>
//!     <node name="Gateway" active="true" position="0">
//!       <sub-package archive="Gateway.nsup" manifest="node_manifest.xml"
//!                    signature-file="node_signature.sig"/>
//!     </node>
//!     <node name="Sensor" active="false"/>
//!   </nodes>
//! </secure-update-package>
//! ```

use flashkit_crypto::FileSet;
use flashkit_system::FlashJob;
use std::collections::BTreeSet;
use std::path::{Component, Path};
use thiserror::Error;

use crate::xml::XmlElement;

pub const PACKAGE_MANIFEST_ROOT: &str = "secure-update-package";
pub const NODE_MANIFEST_ROOT: &str = "node-update-package";

/// Format versions this crate reads and writes
pub const SUPPORTED_FILE_VERSIONS: [u32; 2] = [1, 2];

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Unsupported package file version {0}")]
    UnsupportedFormat(u32),

    #[error("Corrupt manifest: {0}")]
    Corrupt(String),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// File lists and flags of one node, paths relative to a base folder
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeFiles {
    pub application_files: Vec<String>,
    pub nvm_files: Vec<String>,
    pub pem_file: Option<String>,
    pub send_security_state: bool,
    pub security_enabled: bool,
    pub send_debugger_state: bool,
    pub debugger_enabled: bool,
    pub other_accepted_names: BTreeSet<String>,
}

impl NodeFiles {
    pub fn has_content(&self) -> bool {
        !self.application_files.is_empty() || !self.nvm_files.is_empty() || self.pem_file.is_some()
    }

    /// All referenced files
    pub fn file_set(&self) -> FileSet {
        self.application_files
            .iter()
            .chain(self.nvm_files.iter())
            .chain(self.pem_file.iter())
            .collect()
    }

    /// Flash job with paths resolved against `base`
    pub fn to_flash_job(&self, base: &Path) -> FlashJob {
        FlashJob {
            application_files: self.application_files.iter().map(|f| base.join(f)).collect(),
            nvm_files: self.nvm_files.iter().map(|f| base.join(f)).collect(),
            other_accepted_names: self.other_accepted_names.clone(),
            pem_file: self.pem_file.as_ref().map(|f| base.join(f)),
            send_security_state: self.send_security_state,
            security_enabled: self.security_enabled,
            send_debugger_state: self.send_debugger_state,
            debugger_enabled: self.debugger_enabled,
        }
    }

    fn to_xml(&self) -> XmlElement {
        let mut element = XmlElement::new("files");

        let mut applications = XmlElement::new("application-files");
        for file in &self.application_files {
            applications.push(XmlElement::new("file").with_text(file.as_str()));
        }
        element.push(applications);

        let mut nvm = XmlElement::new("nvm-files");
        for file in &self.nvm_files {
            nvm.push(XmlElement::new("file").with_text(file.as_str()));
        }
        element.push(nvm);

        if let Some(pem) = &self.pem_file {
            element.push(XmlElement::new("pem-file").with_text(pem.as_str()));
        }

        element.push(
            XmlElement::new("security-state")
                .with_attribute("send", self.send_security_state)
                .with_attribute("enabled", self.security_enabled),
        );
        element.push(
            XmlElement::new("debugger-state")
                .with_attribute("send", self.send_debugger_state)
                .with_attribute("enabled", self.debugger_enabled),
        );

        let mut names = XmlElement::new("other-accepted-names");
        for name in &self.other_accepted_names {
            names.push(XmlElement::new("name").with_text(name.as_str()));
        }
        element.push(names);

        element
    }

    fn from_xml(element: &XmlElement) -> Result<Self, ManifestError> {
        let list = |name: &str| -> Result<Vec<String>, ManifestError> {
            match element.child(name) {
                Some(c) => c.children_named("file").map(|f| relative_path(&f.text)).collect(),
                None => Ok(Vec::new()),
            }
        };

        let (send_security_state, security_enabled) = state_flags(element.child("security-state"))?;
        let (send_debugger_state, debugger_enabled) = state_flags(element.child("debugger-state"))?;

        Ok(Self {
            application_files: list("application-files")?,
            nvm_files: list("nvm-files")?,
            pem_file: element
                .child("pem-file")
                .map(|c| relative_path(&c.text))
                .transpose()?,
            send_security_state,
            security_enabled,
            send_debugger_state,
            debugger_enabled,
            other_accepted_names: element
                .child("other-accepted-names")
                .map(|c| c.children_named("name").map(|n| n.text.clone()).collect())
                .unwrap_or_default(),
        })
    }
}

/// A file reference that stays below the folder it is relative to
fn relative_path(text: &str) -> Result<String, ManifestError> {
    let enclosed = !text.is_empty()
        && Path::new(text)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if enclosed {
        Ok(text.to_string())
    } else {
        Err(ManifestError::Corrupt(format!(
            "file reference '{}' leaves its folder",
            text
        )))
    }
}

fn state_flags(element: Option<&XmlElement>) -> Result<(bool, bool), ManifestError> {
    match element {
        Some(element) => Ok((
            bool_attribute(element, "send")?.unwrap_or(false),
            bool_attribute(element, "enabled")?.unwrap_or(false),
        )),
        None => Ok((false, false)),
    }
}

fn bool_attribute(element: &XmlElement, key: &str) -> Result<Option<bool>, ManifestError> {
    match element.attribute(key) {
        None => Ok(None),
        Some("true") | Some("1") => Ok(Some(true)),
        Some("false") | Some("0") => Ok(Some(false)),
        Some(other) => Err(ManifestError::Corrupt(format!(
            "<{}> attribute {}: '{}' is not a boolean",
            element.name, key, other
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(text: &str, what: &str) -> Result<T, ManifestError> {
    text.trim()
        .parse()
        .map_err(|_| ManifestError::Corrupt(format!("{} '{}' is not a number", what, text)))
}

fn check_version(root: &XmlElement) -> Result<u32, ManifestError> {
    let version: u32 = parse_number(root.child_text("file-version")?, "file-version")?;
    if !SUPPORTED_FILE_VERSIONS.contains(&version) {
        return Err(ManifestError::UnsupportedFormat(version));
    }
    Ok(version)
}

/// What a node contributes to the package
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeContent {
    None,
    /// Version 1: file lists relative to the package root
    Inline(NodeFiles),
    /// Version 2: own archive, extracted into the node folder
    SubPackage {
        archive: String,
        manifest: String,
        /// Signature inside the node archive; a signed node must verify on load
        signature_file: Option<String>,
    },
}

impl NodeContent {
    pub fn has_content(&self) -> bool {
        match self {
            NodeContent::None => false,
            NodeContent::Inline(files) => files.has_content(),
            NodeContent::SubPackage { .. } => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageNode {
    pub name: String,
    pub active: bool,
    pub content: NodeContent,
}

/// Top level package manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageManifest {
    pub file_version: u32,
    pub active_bus_index: usize,
    pub nodes: Vec<PackageNode>,
    /// Node indices in update order; the XML positions are derived from it
    pub update_order: Vec<usize>,
}

impl PackageManifest {
    pub fn new(file_version: u32, active_bus_index: usize) -> Self {
        Self {
            file_version,
            active_bus_index,
            nodes: Vec::new(),
            update_order: Vec::new(),
        }
    }

    /// Update position of a node
    pub fn position_of(&self, node: usize) -> Option<usize> {
        self.update_order.iter().position(|n| *n == node)
    }

    pub fn active_flags(&self) -> Vec<bool> {
        self.nodes.iter().map(|n| n.active).collect()
    }

    /// Active nodes with content that have no update position
    pub fn unordered_nodes(&self) -> impl Iterator<Item = usize> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(index, node)| {
                node.active && node.content.has_content() && self.position_of(*index).is_none()
            })
            .map(|(index, _)| index)
    }

    /// Check structural consistency
    pub fn validate(&self) -> Result<(), ManifestError> {
        if !SUPPORTED_FILE_VERSIONS.contains(&self.file_version) {
            return Err(ManifestError::UnsupportedFormat(self.file_version));
        }

        let mut seen = BTreeSet::new();
        for &index in &self.update_order {
            let node = self.nodes.get(index).ok_or_else(|| {
                ManifestError::Corrupt(format!("update order refers to unknown node {}", index))
            })?;
            if !seen.insert(index) {
                return Err(ManifestError::Corrupt(format!(
                    "node '{}' appears twice in the update order",
                    node.name
                )));
            }
            if !node.active || !node.content.has_content() {
                return Err(ManifestError::Corrupt(format!(
                    "node '{}' has an update position but nothing to update",
                    node.name
                )));
            }
        }

        for node in &self.nodes {
            let matches_version = match (&node.content, self.file_version) {
                (NodeContent::None, _) => true,
                (NodeContent::Inline(_), 1) => true,
                (NodeContent::SubPackage { .. }, 2) => true,
                _ => false,
            };
            if !matches_version {
                return Err(ManifestError::Corrupt(format!(
                    "node '{}' content does not fit file version {}",
                    node.name, self.file_version
                )));
            }
        }

        Ok(())
    }

    pub fn to_xml(&self) -> XmlElement {
        let mut nodes = XmlElement::new("nodes");
        for (index, node) in self.nodes.iter().enumerate() {
            let mut element = XmlElement::new("node")
                .with_attribute("name", &node.name)
                .with_attribute("active", node.active);
            if let Some(position) = self.position_of(index) {
                element = element.with_attribute("position", position);
            }

            match &node.content {
                NodeContent::None => {}
                NodeContent::Inline(files) => element.push(files.to_xml()),
                NodeContent::SubPackage {
                    archive,
                    manifest,
                    signature_file,
                } => {
                    let mut sub = XmlElement::new("sub-package")
                        .with_attribute("archive", archive)
                        .with_attribute("manifest", manifest);
                    if let Some(signature) = signature_file {
                        sub = sub.with_attribute("signature-file", signature);
                    }
                    element.push(sub);
                }
            }
            nodes.push(element);
        }

        XmlElement::new(PACKAGE_MANIFEST_ROOT)
            .with_child(XmlElement::new("file-version").with_text(self.file_version.to_string()))
            .with_child(
                XmlElement::new("active-bus-index").with_text(self.active_bus_index.to_string()),
            )
            .with_child(nodes)
    }

    pub fn from_xml(root: &XmlElement) -> Result<Self, ManifestError> {
        if root.name != PACKAGE_MANIFEST_ROOT {
            return Err(ManifestError::Corrupt(format!(
                "unexpected root element <{}>",
                root.name
            )));
        }

        let file_version = check_version(root)?;
        let active_bus_index =
            parse_number(root.child_text("active-bus-index")?, "active-bus-index")?;

        let mut nodes = Vec::new();
        let mut positions: Vec<(usize, usize)> = Vec::new();

        let node_elements = root
            .child("nodes")
            .map(|n| n.children_named("node").collect::<Vec<_>>())
            .unwrap_or_default();

        for (index, element) in node_elements.into_iter().enumerate() {
            let name = element.attribute("name").unwrap_or_default().to_string();
            let active = bool_attribute(element, "active")?.ok_or_else(|| {
                ManifestError::Corrupt(format!("node {} lacks the active attribute", index))
            })?;

            if let Some(position) = element.attribute("position") {
                positions.push((parse_number(position, "position")?, index));
            }

            let content = if let Some(files) = element.child("files") {
                NodeContent::Inline(NodeFiles::from_xml(files)?)
            } else if let Some(sub) = element.child("sub-package") {
                let archive = sub.attribute("archive").ok_or_else(|| {
                    ManifestError::Corrupt(format!("node '{}' sub-package lacks archive", name))
                })?;
                let manifest = sub.attribute("manifest").ok_or_else(|| {
                    ManifestError::Corrupt(format!("node '{}' sub-package lacks manifest", name))
                })?;
                NodeContent::SubPackage {
                    archive: relative_path(archive)?,
                    manifest: relative_path(manifest)?,
                    signature_file: sub
                        .attribute("signature-file")
                        .map(relative_path)
                        .transpose()?,
                }
            } else {
                NodeContent::None
            };

            nodes.push(PackageNode {
                name,
                active,
                content,
            });
        }

        positions.sort_unstable();
        for (expected, (position, index)) in positions.iter().enumerate() {
            if *position != expected {
                return Err(ManifestError::Corrupt(format!(
                    "node {} has update position {}; positions must be unique and run from 0 to {}",
                    index,
                    position,
                    positions.len().saturating_sub(1)
                )));
            }
        }

        let manifest = Self {
            file_version,
            active_bus_index,
            nodes,
            update_order: positions.into_iter().map(|(_, index)| index).collect(),
        };
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        self.validate()?;
        self.to_xml().save(path)
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        Self::from_xml(&XmlElement::load(path)?)
    }
}

/// Manifest inside a version 2 node archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSubManifest {
    pub file_version: u32,
    /// Paths relative to the node folder
    pub files: NodeFiles,
    pub signature_file: Option<String>,
}

impl NodeSubManifest {
    pub fn new(files: NodeFiles) -> Self {
        Self {
            file_version: 2,
            files,
            signature_file: None,
        }
    }

    pub fn to_xml(&self) -> XmlElement {
        let mut root = XmlElement::new(NODE_MANIFEST_ROOT)
            .with_child(XmlElement::new("file-version").with_text(self.file_version.to_string()))
            .with_child(self.files.to_xml());
        if let Some(signature) = &self.signature_file {
            root.push(XmlElement::new("signature-file").with_text(signature.as_str()));
        }
        root
    }

    pub fn from_xml(root: &XmlElement) -> Result<Self, ManifestError> {
        if root.name != NODE_MANIFEST_ROOT {
            return Err(ManifestError::Corrupt(format!(
                "unexpected root element <{}>",
                root.name
            )));
        }

        let file_version = check_version(root)?;
        if file_version != 2 {
            return Err(ManifestError::UnsupportedFormat(file_version));
        }

        let files = root
            .child("files")
            .ok_or_else(|| ManifestError::Corrupt("node manifest lacks <files>".into()))?;

        Ok(Self {
            file_version,
            files: NodeFiles::from_xml(files)?,
            signature_file: root
                .child("signature-file")
                .map(|s| relative_path(&s.text))
                .transpose()?,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        self.to_xml().save(path)
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        Self::from_xml(&XmlElement::load(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn files(prefix: &str) -> NodeFiles {
        NodeFiles {
            application_files: vec![format!("{}app.hex", prefix), format!("{}app2.hex", prefix)],
            nvm_files: vec![format!("{}params.hex", prefix)],
            pem_file: Some(format!("{}cert.pem", prefix)),
            send_security_state: true,
            security_enabled: true,
            send_debugger_state: true,
            debugger_enabled: false,
            other_accepted_names: ["ECU_OLD".to_string()].into_iter().collect(),
        }
    }

    fn roundtrip(manifest: &PackageManifest) -> PackageManifest {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("package_manifest.xml");
        manifest.save(&path).unwrap();
        PackageManifest::load(&path).unwrap()
    }

    #[test]
    fn test_roundtrip_without_nodes() {
        let manifest = PackageManifest::new(2, 0);
        assert_eq!(roundtrip(&manifest), manifest);
    }

    #[test]
    fn test_roundtrip_single_inactive_node() {
        let mut manifest = PackageManifest::new(1, 3);
        manifest.nodes.push(PackageNode {
            name: "Only".into(),
            active: false,
            content: NodeContent::None,
        });
        assert_eq!(roundtrip(&manifest), manifest);
    }

    #[test]
    fn test_roundtrip_mixed_v1() {
        let mut manifest = PackageManifest::new(1, 1);
        manifest.nodes = vec![
            PackageNode {
                name: "A".into(),
                active: true,
                content: NodeContent::Inline(files("A/")),
            },
            PackageNode {
                name: "B".into(),
                active: false,
                content: NodeContent::None,
            },
            PackageNode {
                name: "C".into(),
                active: true,
                content: NodeContent::Inline(NodeFiles::default()),
            },
            PackageNode {
                name: "D".into(),
                active: true,
                content: NodeContent::Inline(files("D/")),
            },
        ];
        manifest.update_order = vec![3, 0];
        let loaded = roundtrip(&manifest);
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.position_of(3), Some(0));
        assert_eq!(loaded.position_of(2), None);
    }

    #[test]
    fn test_roundtrip_mixed_v2() {
        let mut manifest = PackageManifest::new(2, 0);
        for (name, active) in [("Gw", true), ("Io", true), ("Off", false)] {
            manifest.nodes.push(PackageNode {
                name: name.into(),
                active,
                content: if active {
                    NodeContent::SubPackage {
                        archive: format!("{}.nsup", name),
                        manifest: "node_manifest.xml".into(),
                        signature_file: (name == "Gw").then(|| "node_signature.sig".into()),
                    }
                } else {
                    NodeContent::None
                },
            });
        }
        manifest.update_order = vec![1, 0];
        assert_eq!(roundtrip(&manifest), manifest);
    }

    #[test]
    fn test_unsupported_version() {
        let xml = "<secure-update-package><file-version>3</file-version></secure-update-package>";
        let root = XmlElement::parse(xml).unwrap();
        assert!(matches!(
            PackageManifest::from_xml(&root),
            Err(ManifestError::UnsupportedFormat(3))
        ));
    }

    #[test]
    fn test_duplicate_positions_are_corrupt() {
        let xml = r#"<secure-update-package>
            <file-version>2</file-version>
            <active-bus-index>0</active-bus-index>
            <nodes>
              <node name="A" active="true" position="0"><sub-package archive="A.nsup" manifest="m.xml"/></node>
              <node name="B" active="true" position="0"><sub-package archive="B.nsup" manifest="m.xml"/></node>
            </nodes>
        </secure-update-package>"#;
        let root = XmlElement::parse(xml).unwrap();
        assert!(matches!(
            PackageManifest::from_xml(&root),
            Err(ManifestError::Corrupt(_))
        ));
    }

    #[test]
    fn test_gap_in_positions_is_corrupt() {
        let xml = r#"<secure-update-package>
            <file-version>2</file-version>
            <active-bus-index>0</active-bus-index>
            <nodes>
              <node name="A" active="true" position="1"><sub-package archive="A.nsup" manifest="m.xml"/></node>
            </nodes>
        </secure-update-package>"#;
        let root = XmlElement::parse(xml).unwrap();
        assert!(PackageManifest::from_xml(&root).is_err());
    }

    #[test]
    fn test_position_on_inactive_node_is_corrupt() {
        let mut manifest = PackageManifest::new(2, 0);
        manifest.nodes.push(PackageNode {
            name: "A".into(),
            active: false,
            content: NodeContent::None,
        });
        manifest.update_order = vec![0];
        assert!(matches!(manifest.validate(), Err(ManifestError::Corrupt(_))));
    }

    #[test]
    fn test_unordered_nodes() {
        let mut manifest = PackageManifest::new(1, 0);
        manifest.nodes.push(PackageNode {
            name: "A".into(),
            active: true,
            content: NodeContent::Inline(files("A/")),
        });
        assert_eq!(manifest.unordered_nodes().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_sub_manifest_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node_manifest.xml");

        let mut sub = NodeSubManifest::new(files(""));
        sub.signature_file = Some("node_signature.sig".into());
        sub.save(&path).unwrap();
        assert_eq!(NodeSubManifest::load(&path).unwrap(), sub);

        let plain = NodeSubManifest::new(NodeFiles::default());
        plain.save(&path).unwrap();
        assert_eq!(NodeSubManifest::load(&path).unwrap(), plain);
    }

    #[test]
    fn test_escaping_file_references_are_corrupt() {
        for bad in ["../outside.hex", "/etc/passwd", "app/../../x.hex", ""] {
            let xml = format!(
                "<node-update-package><file-version>2</file-version><files>\
                 <application-files><file>{}</file></application-files></files>\
                 </node-update-package>",
                bad
            );
            let root = XmlElement::parse(&xml).unwrap();
            assert!(
                matches!(NodeSubManifest::from_xml(&root), Err(ManifestError::Corrupt(_))),
                "{} accepted",
                bad
            );
        }

        let xml = "<secure-update-package><file-version>2</file-version>\
                   <active-bus-index>0</active-bus-index><nodes>\
                   <node name=\"A\" active=\"true\" position=\"0\">\
                   <sub-package archive=\"A.nsup\" manifest=\"../m.xml\"/></node>\
                   </nodes></secure-update-package>";
        let root = XmlElement::parse(xml).unwrap();
        assert!(matches!(
            PackageManifest::from_xml(&root),
            Err(ManifestError::Corrupt(_))
        ));

        assert_eq!(relative_path("./sub/app.hex").unwrap(), "./sub/app.hex");
    }

    #[test]
    fn test_file_set_and_job() {
        let files = files("");
        assert_eq!(files.file_set().len(), 4);

        let job = files.to_flash_job(Path::new("/pkg/Node"));
        assert_eq!(job.application_files[0], Path::new("/pkg/Node/app.hex"));
        assert_eq!(job.pem_file.as_deref(), Some(Path::new("/pkg/Node/cert.pem")));
        assert!(job.accepts_device_name("ECU", "ECU_OLD"));
    }
}
