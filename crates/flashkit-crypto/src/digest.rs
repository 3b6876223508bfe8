//! Content digests over file sets

use sha2::{Digest as _, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::{CryptoError, Result};

const CHUNK_SIZE: usize = 8192;

/// Set of relative (or absolute) file paths, always in canonical order
///
/// Paths are stored with `/` separators. Inserting a path twice has no effect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSet {
    paths: BTreeSet<String>,
}

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a path; returns false if it was already present
    pub fn insert(&mut self, path: impl AsRef<str>) -> bool {
        self.paths.insert(path.as_ref().replace('\\', "/"))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains(&path.replace('\\', "/"))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Resolve the entries against `base`
    pub fn resolve<'a>(&'a self, base: Option<&'a Path>) -> impl Iterator<Item = PathBuf> + 'a {
        self.paths.iter().map(move |p| match base {
            Some(base) => base.join(p),
            None => PathBuf::from(p),
        })
    }
}

impl<S: AsRef<str>> FromIterator<S> for FileSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

impl<S: AsRef<str>> Extend<S> for FileSet {
    fn extend<I: IntoIterator<Item = S>>(&mut self, iter: I) {
        for path in iter {
            self.insert(path);
        }
    }
}

/// SHA-256 value
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(text: &str) -> Option<Self> {
        let bytes = hex::decode(text.trim()).ok()?;
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Hash the contents of all files of `files` in canonical order
///
/// Files are streamed in 8 KiB chunks into a single accumulator. Entries are
/// resolved against `base` if given, otherwise used as they are.
pub fn digest_files(files: &FileSet, base: Option<&Path>) -> Result<Digest> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; CHUNK_SIZE];

    for path in files.resolve(base) {
        let mut file = File::open(&path).map_err(|e| CryptoError::io(&path, e))?;
        loop {
            let read = file
                .read(&mut buffer)
                .map_err(|e| CryptoError::io(&path, e))?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
    }

    Ok(Digest(hasher.finalize().into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn write_files(dir: &Path, files: &[(&str, &[u8])]) {
        for (name, content) in files {
            let path = dir.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, content).unwrap();
        }
    }

    #[test]
    fn test_duplicate_insert_is_noop() {
        let mut set = FileSet::new();
        assert!(set.insert("a/b.hex"));
        assert!(!set.insert("a\\b.hex"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_digest_matches_concatenation() {
        let dir = tempfile::tempdir().unwrap();
        write_files(dir.path(), &[("b.bin", b"world"), ("a.bin", b"hello ")]);

        let set: FileSet = ["b.bin", "a.bin"].into_iter().collect();
        let digest = digest_files(&set, Some(dir.path())).unwrap();

        let expected: [u8; 32] = Sha256::digest(b"hello world").into();
        assert_eq!(digest.as_bytes(), &expected);
    }

    #[test]
    fn test_large_file_streams() {
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..(CHUNK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        write_files(dir.path(), &[("big.bin", &content)]);

        let set: FileSet = ["big.bin"].into_iter().collect();
        let digest = digest_files(&set, Some(dir.path())).unwrap();
        let expected: [u8; 32] = Sha256::digest(&content).into();
        assert_eq!(digest.as_bytes(), &expected);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let set: FileSet = ["missing.bin"].into_iter().collect();
        match digest_files(&set, Some(dir.path())) {
            Err(CryptoError::Io { path, .. }) => assert!(path.ends_with("missing.bin")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_absolute_paths_without_base() {
        let dir = tempfile::tempdir().unwrap();
        write_files(dir.path(), &[("x.bin", b"x")]);
        let absolute = dir.path().join("x.bin");

        let set: FileSet = [absolute.to_string_lossy()].into_iter().collect();
        let relative: FileSet = ["x.bin"].into_iter().collect();
        assert_eq!(
            digest_files(&set, None).unwrap(),
            digest_files(&relative, Some(dir.path())).unwrap()
        );
    }

    #[test]
    fn test_hex_roundtrip() {
        let digest = Digest::from_bytes([0xAB; 32]);
        assert_eq!(Digest::from_hex(&digest.to_hex()), Some(digest));
        assert_eq!(Digest::from_hex("abcd"), None);
    }

    proptest! {
        #[test]
        fn digest_ignores_insertion_order(mut order in Just(vec![0usize, 1, 2, 3]).prop_shuffle()) {
            let dir = tempfile::tempdir().unwrap();
            let names = ["n1/app.hex", "n1/param.hex", "n2/app.hex", "root.bin"];
            for (index, name) in names.iter().enumerate() {
                let path = dir.path().join(name);
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(path, vec![index as u8; 100 + index]).unwrap();
            }

            let sorted: FileSet = names.iter().collect();
            order.push(order[0]);
            let shuffled: FileSet = order.iter().map(|i| names[*i]).collect();

            prop_assert_eq!(
                digest_files(&sorted, Some(dir.path())).unwrap(),
                digest_files(&shuffled, Some(dir.path())).unwrap()
            );
        }
    }
}
