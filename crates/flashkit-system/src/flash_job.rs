//! Per node update content

use std::collections::BTreeSet;
use std::path::PathBuf;

/// Everything that shall be written to one node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashJob {
    /// Application images in transfer order
    pub application_files: Vec<PathBuf>,

    /// NVM parameter images in transfer order
    pub nvm_files: Vec<PathBuf>,

    /// Device names accepted in addition to the definition's names
    pub other_accepted_names: BTreeSet<String>,

    /// Certificate to store on the node
    pub pem_file: Option<PathBuf>,

    pub send_security_state: bool,
    pub security_enabled: bool,
    pub send_debugger_state: bool,
    pub debugger_enabled: bool,
}

impl FlashJob {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_application(mut self, path: impl Into<PathBuf>) -> Self {
        self.application_files.push(path.into());
        self
    }

    pub fn with_nvm(mut self, path: impl Into<PathBuf>) -> Self {
        self.nvm_files.push(path.into());
        self
    }

    pub fn with_pem(mut self, path: impl Into<PathBuf>) -> Self {
        self.pem_file = Some(path.into());
        self
    }

    pub fn with_security_state(mut self, enabled: bool) -> Self {
        self.send_security_state = true;
        self.security_enabled = enabled;
        self
    }

    pub fn with_debugger_state(mut self, enabled: bool) -> Self {
        self.send_debugger_state = true;
        self.debugger_enabled = enabled;
        self
    }

    pub fn accept_name(mut self, name: impl Into<String>) -> Self {
        self.other_accepted_names.insert(name.into());
        self
    }

    /// True if there is at least one file to apply
    pub fn has_content(&self) -> bool {
        !self.application_files.is_empty() || !self.nvm_files.is_empty() || self.pem_file.is_some()
    }

    pub fn accepts_device_name(&self, expected: &str, reported: &str) -> bool {
        expected == reported || self.other_accepted_names.contains(reported)
    }

    /// All files of the job: applications, NVM files, PEM file
    pub fn files(&self) -> impl Iterator<Item = &PathBuf> {
        self.application_files
            .iter()
            .chain(self.nvm_files.iter())
            .chain(self.pem_file.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_content() {
        assert!(!FlashJob::new().has_content());
        assert!(!FlashJob::new().with_security_state(true).has_content());
        assert!(FlashJob::new().with_pem("cert.pem").has_content());
        assert!(FlashJob::new().with_nvm("params.hex").has_content());
    }

    #[test]
    fn test_files_order() {
        let job = FlashJob::new()
            .with_application("a.hex")
            .with_application("b.hex")
            .with_nvm("n.hex")
            .with_pem("c.pem");
        let names: Vec<_> = job.files().map(|p| p.to_string_lossy().into_owned()).collect();
        assert_eq!(names, vec!["a.hex", "b.hex", "n.hex", "c.pem"]);
    }

    #[test]
    fn test_accepts_device_name() {
        let job = FlashJob::new().accept_name("ECU_OLD");
        assert!(job.accepts_device_name("ECU", "ECU"));
        assert!(job.accepts_device_name("ECU", "ECU_OLD"));
        assert!(!job.accepts_device_name("ECU", "OTHER"));
    }
}
