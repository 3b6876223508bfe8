//! Per node encryption and signing settings

use std::path::PathBuf;

use crate::PackageError;

/// Expand a 0/1/N list to one optional entry per node
///
/// An empty list means "off for every node", a single entry applies to every
/// node and a list of `node_count` entries is taken as it is. Any other length
/// is a `ConfigMismatch`.
pub fn expand_per_node<T: Clone>(
    values: &[T],
    node_count: usize,
    what: &str,
) -> Result<Vec<Option<T>>, PackageError> {
    match values.len() {
        0 => Ok(vec![None; node_count]),
        1 => Ok(vec![Some(values[0].clone()); node_count]),
        len if len == node_count => Ok(values.iter().cloned().map(Some).collect()),
        len => Err(PackageError::ConfigMismatch {
            what: what.to_string(),
            len,
            expected: node_count,
        }),
    }
}

/// Security settings of one node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PerNodeSecurityConfig {
    /// Passphrase for the node archive; `None` leaves it unencrypted
    pub passphrase: Option<String>,
    /// Key file used to sign the node content
    pub signing_key: Option<PathBuf>,
}

impl PerNodeSecurityConfig {
    pub fn is_empty(&self) -> bool {
        self.passphrase.is_none() && self.signing_key.is_none()
    }
}

/// Security settings for all nodes of a package build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityOptions {
    per_node: Vec<Option<PerNodeSecurityConfig>>,
}

impl SecurityOptions {
    /// No encryption and no signatures
    pub fn none(node_count: usize) -> Self {
        Self {
            per_node: vec![None; node_count],
        }
    }

    pub fn from_nodes(per_node: Vec<Option<PerNodeSecurityConfig>>) -> Self {
        Self { per_node }
    }

    /// Build from parallel lists, each following the 0/1/N convention
    pub fn from_parallel(
        encrypt: &[bool],
        passphrases: &[String],
        sign: &[bool],
        keys: &[PathBuf],
        node_count: usize,
    ) -> Result<Self, PackageError> {
        let encrypt = expand_per_node(encrypt, node_count, "encryption flags")?;
        let passphrases = expand_per_node(passphrases, node_count, "passphrases")?;
        let sign = expand_per_node(sign, node_count, "signature flags")?;
        let keys = expand_per_node(keys, node_count, "signing keys")?;

        let mut per_node = Vec::with_capacity(node_count);
        for index in 0..node_count {
            let mut config = PerNodeSecurityConfig::default();

            if encrypt[index].unwrap_or(false) {
                match passphrases[index].as_deref() {
                    Some(passphrase) if !passphrase.is_empty() => {
                        config.passphrase = Some(passphrase.to_string());
                    }
                    _ => {
                        return Err(PackageError::Config(format!(
                            "encryption requested for node {} without passphrase",
                            index
                        )));
                    }
                }
            }

            if sign[index].unwrap_or(false) {
                match &keys[index] {
                    Some(key) if !key.as_os_str().is_empty() => {
                        config.signing_key = Some(key.clone());
                    }
                    _ => {
                        return Err(PackageError::Config(format!(
                            "signature requested for node {} without key",
                            index
                        )));
                    }
                }
            }

            per_node.push((!config.is_empty()).then_some(config));
        }

        Ok(Self { per_node })
    }

    pub fn len(&self) -> usize {
        self.per_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.per_node.is_empty()
    }

    pub fn for_node(&self, index: usize) -> Option<&PerNodeSecurityConfig> {
        self.per_node.get(index).and_then(Option::as_ref)
    }

    pub fn passphrase(&self, index: usize) -> Option<&str> {
        self.for_node(index).and_then(|c| c.passphrase.as_deref())
    }

    pub fn signing_key(&self, index: usize) -> Option<&PathBuf> {
        self.for_node(index).and_then(|c| c.signing_key.as_ref())
    }

    pub fn any_encryption(&self) -> bool {
        (0..self.per_node.len()).any(|i| self.passphrase(i).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_broadcast_convention() {
        assert_eq!(expand_per_node::<u8>(&[], 3, "x").unwrap(), vec![None, None, None]);
        assert_eq!(
            expand_per_node(&[7], 3, "x").unwrap(),
            vec![Some(7), Some(7), Some(7)]
        );
        assert_eq!(
            expand_per_node(&[1, 2, 3], 3, "x").unwrap(),
            vec![Some(1), Some(2), Some(3)]
        );
        assert!(matches!(
            expand_per_node(&[1, 2], 3, "x"),
            Err(PackageError::ConfigMismatch { len: 2, expected: 3, .. })
        ));
    }

    #[test]
    fn test_single_entry_with_single_node() {
        assert_eq!(expand_per_node(&[5], 1, "x").unwrap(), vec![Some(5)]);
    }

    #[test]
    fn test_from_parallel_mixed() {
        let options = SecurityOptions::from_parallel(
            &[true, false],
            &["pw".to_string()],
            &[false, true],
            &[PathBuf::from("key.pem")],
            2,
        )
        .unwrap();

        assert_eq!(options.passphrase(0), Some("pw"));
        assert_eq!(options.signing_key(0), None);
        assert_eq!(options.passphrase(1), None);
        assert_eq!(options.signing_key(1), Some(&PathBuf::from("key.pem")));
        assert!(options.any_encryption());
    }

    #[test]
    fn test_from_parallel_all_off() {
        let options = SecurityOptions::from_parallel(&[], &[], &[], &[], 4).unwrap();
        assert_eq!(options.len(), 4);
        assert!((0..4).all(|i| options.for_node(i).is_none()));
    }

    #[test]
    fn test_encryption_without_passphrase() {
        let result = SecurityOptions::from_parallel(&[true], &[String::new()], &[], &[], 2);
        assert!(matches!(result, Err(PackageError::Config(_))));
    }

    #[test]
    fn test_length_mismatch() {
        let keys = vec![PathBuf::from("a"), PathBuf::from("b")];
        let result = SecurityOptions::from_parallel(&[], &[], &[true], &keys, 3);
        assert!(matches!(result, Err(PackageError::ConfigMismatch { .. })));
    }
}
