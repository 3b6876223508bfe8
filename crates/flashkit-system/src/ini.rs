//! Minimal section based INI document

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::{Result, SystemError};

/// Ordered INI document
///
/// Sections and keys keep their insertion order so that a written file reads the
/// same way it was produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniDocument {
    sections: Vec<(String, Vec<(String, String)>)>,
}

impl IniDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut document = Self::new();
        let mut current: Option<String> = None;

        for (number, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[') {
                let name = name.strip_suffix(']').ok_or_else(|| SystemError::Ini {
                    line: number + 1,
                    message: "unterminated section header".into(),
                })?;
                let name = name.trim().to_string();
                document.section_mut(&name);
                current = Some(name);
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| SystemError::Ini {
                line: number + 1,
                message: format!("expected key=value, got '{}'", line),
            })?;

            let section = current.as_deref().ok_or_else(|| SystemError::Ini {
                line: number + 1,
                message: "entry outside of any section".into(),
            })?;

            document.set(section, key.trim(), value.trim());
        }

        Ok(document)
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SystemError::NotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_string())?;
        Ok(())
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|(name, _)| name == section)
            .and_then(|(_, entries)| entries.iter().find(|(k, _)| k == key))
            .map(|(_, v)| v.as_str())
    }

    /// Read and parse a mandatory entry
    pub fn require<T: FromStr>(&self, section: &str, key: &str) -> Result<T> {
        let value = self
            .get(section, key)
            .ok_or_else(|| SystemError::IniEntryMissing {
                section: section.to_string(),
                key: key.to_string(),
            })?;

        value.parse().map_err(|_| {
            SystemError::Invalid(format!("[{}] {} has invalid value '{}'", section, key, value))
        })
    }

    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        let value = value.into();
        let entries = self.section_mut(section);
        match entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => entries.push((key.to_string(), value)),
        }
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.iter().any(|(name, _)| name == section)
    }

    fn section_mut(&mut self, section: &str) -> &mut Vec<(String, String)> {
        let index = match self.sections.iter().position(|(name, _)| name == section) {
            Some(index) => index,
            None => {
                self.sections.push((section.to_string(), Vec::new()));
                self.sections.len() - 1
            }
        };
        &mut self.sections[index].1
    }
}

impl fmt::Display for IniDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (name, entries)) in self.sections.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            writeln!(f, "[{}]", name)?;
            for (key, value) in entries {
                writeln!(f, "{}={}", key, value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sections_and_comments() {
        let text = "; device index\n[DeviceTypes]\nNumTypes = 1\nTypeName1=Modern\n\n# group\n[Modern]\nNumDevices=1\nDevice1=Modern/ecu.devdef\n";
        let ini = IniDocument::parse(text).unwrap();
        assert_eq!(ini.get("DeviceTypes", "NumTypes"), Some("1"));
        assert_eq!(ini.get("Modern", "Device1"), Some("Modern/ecu.devdef"));
        assert_eq!(ini.require::<usize>("Modern", "NumDevices").unwrap(), 1);
    }

    #[test]
    fn test_missing_entry() {
        let ini = IniDocument::parse("[A]\nx=1\n").unwrap();
        let result = ini.require::<usize>("A", "y");
        assert!(matches!(result, Err(SystemError::IniEntryMissing { .. })));
    }

    #[test]
    fn test_syntax_errors_report_line() {
        match IniDocument::parse("[A]\nno separator\n") {
            Err(SystemError::Ini { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(IniDocument::parse("key=value\n").is_err());
        assert!(IniDocument::parse("[open\n").is_err());
    }

    #[test]
    fn test_write_and_reparse() {
        let mut ini = IniDocument::new();
        ini.set("DeviceTypes", "NumTypes", "2");
        ini.set("DeviceTypes", "TypeName1", "Modern");
        ini.set("DeviceTypes", "NumTypes", "1");

        let text = ini.to_string();
        assert!(text.starts_with("[DeviceTypes]\nNumTypes=1\n"));
        assert_eq!(IniDocument::parse(&text).unwrap(), ini);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.ini");

        let mut ini = IniDocument::new();
        ini.set("Legacy", "NumDevices", "0");
        ini.save(&path).unwrap();

        let loaded = IniDocument::load(&path).unwrap();
        assert!(loaded.has_section("Legacy"));
        assert!(IniDocument::load(&dir.path().join("missing.ini")).is_err());
    }
}
