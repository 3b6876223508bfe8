//! Zip archive creation and extraction

use flashkit_crypto::FileSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Deflate level used when none is configured
pub const DEFAULT_COMPRESSION_LEVEL: i64 = 6;

const ZIP_MAGIC: [u8; 4] = [b'P', b'K', 0x03, 0x04];

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Archive input missing: {0}")]
    MissingInput(PathBuf),

    #[error("Could not write archive {path}: {reason}")]
    WriteFailed { path: PathBuf, reason: String },

    #[error("Could not read archive {path}: {reason}")]
    ReadFailed { path: PathBuf, reason: String },
}

impl ArchiveError {
    fn write(path: &Path, reason: impl ToString) -> Self {
        Self::WriteFailed {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    fn read(path: &Path, reason: impl ToString) -> Self {
        Self::ReadFailed {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

/// Zip the files of `files` (relative to `base_dir`) into `output`
pub fn create_zip(base_dir: &Path, files: &FileSet, output: &Path) -> Result<(), ArchiveError> {
    create_zip_with_level(base_dir, files, output, DEFAULT_COMPRESSION_LEVEL)
}

/// Like [`create_zip`] with an explicit deflate level
pub fn create_zip_with_level(
    base_dir: &Path,
    files: &FileSet,
    output: &Path,
    compression_level: i64,
) -> Result<(), ArchiveError> {
    for relative in files.iter() {
        let path = base_dir.join(relative);
        if !path.is_file() {
            return Err(ArchiveError::MissingInput(path));
        }
    }

    let file = File::create(output).map_err(|e| ArchiveError::write(output, e))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(compression_level));

    for relative in files.iter() {
        writer
            .start_file(relative, options)
            .map_err(|e| ArchiveError::write(output, e))?;

        let mut input = File::open(base_dir.join(relative))
            .map_err(|_| ArchiveError::MissingInput(base_dir.join(relative)))?;
        io::copy(&mut input, &mut writer).map_err(|e| ArchiveError::write(output, e))?;
    }

    writer.finish().map_err(|e| ArchiveError::write(output, e))?;
    debug!("Wrote {} entries to {}", files.len(), output.display());
    Ok(())
}

/// Extract `archive` into `target_dir`, creating it if needed
///
/// Entries that would land outside of `target_dir` are rejected.
pub fn extract_zip(archive: &Path, target_dir: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    let file = File::open(archive).map_err(|e| ArchiveError::read(archive, e))?;
    let mut zip = ZipArchive::new(file).map_err(|e| ArchiveError::read(archive, e))?;

    fs::create_dir_all(target_dir).map_err(|e| ArchiveError::read(archive, e))?;

    let mut extracted = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| ArchiveError::read(archive, e))?;

        let relative = entry.enclosed_name().ok_or_else(|| {
            ArchiveError::read(archive, format!("entry '{}' escapes the target", entry.name()))
        })?;
        let destination = target_dir.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&destination).map_err(|e| ArchiveError::read(archive, e))?;
            continue;
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|e| ArchiveError::read(archive, e))?;
        }
        let mut out = File::create(&destination).map_err(|e| ArchiveError::read(archive, e))?;
        io::copy(&mut entry, &mut out).map_err(|e| ArchiveError::read(archive, e))?;
        extracted.push(relative);
    }

    debug!(
        "Extracted {} files from {} to {}",
        extracted.len(),
        archive.display(),
        target_dir.display()
    );
    Ok(extracted)
}

/// Cheap check of the local file header signature
pub fn is_zip(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    match File::open(path) {
        Ok(mut file) => file.read_exact(&mut magic).is_ok() && magic == ZIP_MAGIC,
        Err(_) => false,
    }
}

/// All regular files below `dir`, relative to it
pub fn collect_files(dir: &Path) -> Result<FileSet, ArchiveError> {
    let mut files = FileSet::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| ArchiveError::read(dir, e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| ArchiveError::read(dir, e))?;
        files.insert(relative.to_string_lossy());
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn populate(dir: &Path) -> FileSet {
        fs::create_dir_all(dir.join("Node1")).unwrap();
        fs::write(dir.join("Node1/app.hex"), b":00000001FF\n").unwrap();
        fs::write(dir.join("top.xml"), b"<x/>").unwrap();
        ["Node1/app.hex", "top.xml"].into_iter().collect()
    }

    #[test]
    fn test_zip_roundtrip() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        let files = populate(&source);
        let archive = dir.path().join("out.zip");

        create_zip(&source, &files, &archive).unwrap();
        assert!(is_zip(&archive));

        let target = dir.path().join("a/b/c");
        let extracted = extract_zip(&archive, &target).unwrap();
        assert_eq!(extracted.len(), 2);
        assert_eq!(fs::read(target.join("Node1/app.hex")).unwrap(), b":00000001FF\n");
        assert_eq!(collect_files(&target).unwrap(), files);
    }

    #[test]
    fn test_missing_input() {
        let dir = TempDir::new().unwrap();
        let files: FileSet = ["absent.bin"].into_iter().collect();
        let result = create_zip(dir.path(), &files, &dir.path().join("out.zip"));
        assert!(matches!(result, Err(ArchiveError::MissingInput(_))));
    }

    #[test]
    fn test_write_failed_for_unwritable_target() {
        let dir = TempDir::new().unwrap();
        let files = populate(dir.path());
        let result = create_zip(dir.path(), &files, &dir.path().join("no/such/dir/out.zip"));
        assert!(matches!(result, Err(ArchiveError::WriteFailed { .. })));
    }

    #[test]
    fn test_corrupt_archive() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("broken.zip");
        fs::write(&archive, b"PK\x03\x04 but nothing else").unwrap();

        assert!(is_zip(&archive));
        let result = extract_zip(&archive, &dir.path().join("out"));
        assert!(matches!(result, Err(ArchiveError::ReadFailed { .. })));
    }

    #[test]
    fn test_zip_slip_rejected() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("evil.zip");
        {
            let mut writer = ZipWriter::new(File::create(&archive).unwrap());
            writer
                .start_file("../escape.txt", SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"gotcha").unwrap();
            writer.finish().unwrap();
        }

        let result = extract_zip(&archive, &dir.path().join("target"));
        assert!(matches!(result, Err(ArchiveError::ReadFailed { .. })));
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn test_is_zip_on_other_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short");
        fs::write(&path, b"PK").unwrap();
        assert!(!is_zip(&path));
        fs::write(&path, b"encrypted garbage").unwrap();
        assert!(!is_zip(&path));
        assert!(!is_zip(&dir.path().join("missing")));
    }
}
