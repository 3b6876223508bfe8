//! flashkit command line tool
//!
//! Builds, unpacks and inspects secure update packages and exposes the
//! digest and file encryption helpers for scripting.

mod job_file;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use flashkit_config::FlashkitConfig;
use flashkit_crypto::{PrivateKey, digest_files};
use flashkit_package::{
    PackageBuildRequest, PackageBuilder, PackageLoadRequest, PackageLoader, collect_files,
};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::job_file::PackageJobFile;

#[derive(Debug, Parser)]
#[command(name = "flashkit", version, about = "Secure update package tool")]
struct Cli {
    /// Configuration file laid over the defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build an update package from a job description
    Create {
        /// Job description (TOML)
        job: PathBuf,
        /// Package to create (must end with .sup)
        output: PathBuf,
        /// Package format version, overrides job file and configuration
        #[arg(long)]
        file_version: Option<u32>,
    },

    /// Unpack and verify an update package
    Unpack {
        /// Package file or already extracted directory
        package: PathBuf,
        /// Directory receiving the package content (cleared first)
        target: PathBuf,
        /// Node passphrase; give once for all nodes or once per node
        #[arg(long = "passphrase")]
        passphrases: Vec<String>,
        /// Signer certificate; give once for all nodes or once per node
        #[arg(long = "certificate")]
        certificates: Vec<PathBuf>,
    },

    /// Print the SHA-256 digest over all files below a directory
    Digest { dir: PathBuf },

    /// Encrypt a file with a passphrase
    Encrypt {
        input: PathBuf,
        output: PathBuf,
        #[arg(long)]
        passphrase: String,
    },

    /// Decrypt a file encrypted with `encrypt`
    Decrypt {
        input: PathBuf,
        output: PathBuf,
        #[arg(long)]
        passphrase: String,
    },

    /// Generate a P-256 signing key
    Keygen {
        /// Output file for the PKCS#8 PEM private key
        key: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    setup_logging(&config);

    match cli.command {
        Command::Create {
            job,
            output,
            file_version,
        } => create(&config, &job, output, file_version),
        Command::Unpack {
            package,
            target,
            passphrases,
            certificates,
        } => unpack(package, target, passphrases, certificates),
        Command::Digest { dir } => digest(&dir),
        Command::Encrypt {
            input,
            output,
            passphrase,
        } => {
            flashkit_crypto::encrypt_file(&passphrase, &input, &output)
                .with_context(|| format!("Failed to encrypt {}", input.display()))?;
            info!("Encrypted {} to {}", input.display(), output.display());
            Ok(())
        }
        Command::Decrypt {
            input,
            output,
            passphrase,
        } => {
            flashkit_crypto::decrypt_file(&passphrase, &input, &output)
                .with_context(|| format!("Failed to decrypt {}", input.display()))?;
            info!("Decrypted {} to {}", input.display(), output.display());
            Ok(())
        }
        Command::Keygen { key } => keygen(&key),
    }
}

fn load_config(path: Option<&Path>) -> Result<FlashkitConfig> {
    match path {
        Some(path) => FlashkitConfig::load_overlay(path)
            .with_context(|| format!("Failed to load configuration {}", path.display())),
        None => FlashkitConfig::load_default().context("Failed to load configuration"),
    }
}

/// Setup logging to stderr; `RUST_LOG` wins over the configured level
fn setup_logging(config: &FlashkitConfig) {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(config.logging.ansi)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn create(
    config: &FlashkitConfig,
    job_path: &Path,
    output: PathBuf,
    file_version: Option<u32>,
) -> Result<()> {
    let job = PackageJobFile::load(job_path)?;
    let base = job_path.parent().unwrap_or_else(|| Path::new("."));
    let resolved = job.resolve(base)?;

    let request = PackageBuildRequest {
        target: output,
        system: &resolved.system,
        devices: &resolved.devices,
        active_bus_index: resolved.active_bus,
        active_nodes: resolved.active_nodes.clone(),
        update_order: resolved.update_order.clone(),
        jobs: resolved.jobs.clone(),
        security: resolved.security.clone(),
        file_version: file_version
            .or(resolved.file_version)
            .unwrap_or(config.package.format_version),
    };

    let report = PackageBuilder::new(config.package.clone())
        .build(&request)
        .with_context(|| format!("Failed to build {}", request.target.display()))?;

    for warning in &report.warnings {
        warn!("{}", warning);
    }
    println!("Created {} (format version {})", request.target.display(), report.file_version);
    if let Some(digest) = &report.package_digest {
        println!("package  {}", digest.to_hex());
    }
    for (index, digest) in report.node_digests.iter().enumerate() {
        if let (Some(digest), Some(node)) = (digest, resolved.system.node(index)) {
            println!("{:<8} {}", node.name, digest.to_hex());
        }
    }
    Ok(())
}

fn unpack(
    package: PathBuf,
    target: PathBuf,
    passphrases: Vec<String>,
    certificates: Vec<PathBuf>,
) -> Result<()> {
    let request = PackageLoadRequest {
        package,
        target_dir: target,
        passphrases,
        certificates,
    };
    let loaded = PackageLoader::new()
        .process(&request)
        .with_context(|| format!("Failed to unpack {}", request.package.display()))?;

    for warning in &loaded.warnings {
        warn!("{}", warning);
    }
    println!(
        "System {} (format version {}), active bus {}",
        loaded.system.name, loaded.file_version, loaded.active_bus_index
    );
    for (position, &index) in loaded.update_order.iter().enumerate() {
        let Some(node) = loaded.system.node(index) else {
            bail!("Update order refers to unknown node {}", index);
        };
        let job = &loaded.jobs[index];
        println!(
            "{:>3}. {:<16} {} application(s), {} NVM file(s){}",
            position + 1,
            node.name,
            job.application_files.len(),
            job.nvm_files.len(),
            if job.pem_file.is_some() { ", PEM" } else { "" }
        );
    }
    Ok(())
}

fn digest(dir: &Path) -> Result<()> {
    let files = collect_files(dir).with_context(|| format!("Failed to list {}", dir.display()))?;
    let digest = digest_files(&files, Some(dir))
        .with_context(|| format!("Failed to hash {}", dir.display()))?;
    println!("{}  {} ({} files)", digest.to_hex(), dir.display(), files.len());
    Ok(())
}

fn keygen(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }

    let key = PrivateKey::generate();
    let pem = key.to_pem().context("Failed to encode key")?;
    std::fs::write(path, pem).with_context(|| format!("Failed to write {}", path.display()))?;

    info!("Wrote signing key to {}", path.display());
    println!("public key 04{}", hex::encode(key.public_key().to_bytes()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_unpack_lists() {
        let cli = Cli::try_parse_from([
            "flashkit",
            "unpack",
            "update.sup",
            "out",
            "--passphrase",
            "a",
            "--passphrase",
            "b",
            "--certificate",
            "signer.pem",
        ])
        .unwrap();

        match cli.command {
            Command::Unpack {
                passphrases,
                certificates,
                ..
            } => {
                assert_eq!(passphrases, vec!["a", "b"]);
                assert_eq!(certificates, vec![PathBuf::from("signer.pem")]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_keygen_refuses_overwrite() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("key.pem");

        keygen(&path).unwrap();
        let pem = std::fs::read_to_string(&path).unwrap();
        assert!(PrivateKey::from_pem(&pem).is_ok());
        assert!(keygen(&path).is_err());
    }
}
