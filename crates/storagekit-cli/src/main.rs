//! Storagekit CLI - File operations across configured storage mounts
//!
//! Usage:
//!   storagekit --config mounts.json ls disk:docs      # List a directory
//!   storagekit --config mounts.json cp disk:a cloud:a # Copy across mounts
//!   storagekit ls .                                   # Current directory as mount `local`

mod mounts;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use std::path::PathBuf;
use storagekit::{HashAlgorithm, Storage, path};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

use mounts::{CliConfig, Mounts};

/// Storagekit - Pluggable storage backends
#[derive(Parser, Debug)]
#[command(name = "storagekit")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Mount table (JSON). Without it the current directory is mounted as `local`.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show configured mounts
    Mounts,
    /// List a directory
    Ls { address: String },
    /// Print a file to stdout
    Cat { address: String },
    /// Upload a local file
    Put { file: PathBuf, address: String },
    /// Show metadata as JSON
    Stat { address: String },
    /// Remove a file or directory tree
    Rm { address: String },
    /// Create a directory
    Mkdir {
        address: String,
        /// Create missing parents
        #[arg(short, long)]
        parents: bool,
    },
    /// Copy, across mounts if needed
    Cp { source: String, target: String },
    /// Move, across mounts if needed
    Mv { source: String, target: String },
    /// Case-insensitive file name search in a mount
    Search { mount: String, query: String },
    /// Content digest
    Hash {
        address: String,
        #[arg(short, long, default_value = "sha256")]
        algorithm: HashAlgorithm,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => CliConfig::load(path)?,
        None => CliConfig::local(&std::env::current_dir().context("No current directory")?),
    };
    let mounts = Mounts::mount(config)?;
    run(&mounts, args.command).await
}

async fn run(mounts: &Mounts, command: Command) -> Result<()> {
    match command {
        Command::Mounts => {
            for (name, storage) in mounts.iter() {
                let availability = storage.get_availability();
                println!(
                    "{}\t{}\t{}",
                    name,
                    storage.id(),
                    if availability.available { "available" } else { "unavailable" }
                );
            }
        }
        Command::Ls { address } => {
            let (storage, dir) = mounts.resolve(&address)?;
            let mut entries = storage.directory_contents(&dir);
            while let Some(entry) = entries.next().await {
                let entry = entry.with_context(|| format!("Failed to list {}", address))?;
                let kind = if entry.is_dir() { 'd' } else { '-' };
                let size = if entry.size < 0 { 0 } else { entry.size };
                println!("{} {:>12} {} {}", kind, size, entry.mtime, entry.name);
            }
        }
        Command::Cat { address } => {
            let (storage, file) = mounts.resolve(&address)?;
            let mut reader = storage.open_read(&file).await?;
            let mut stdout = tokio::io::stdout();
            tokio::io::copy(&mut reader, &mut stdout).await?;
            stdout.flush().await?;
        }
        Command::Put { file, address } => {
            let (storage, target) = mounts.resolve(&address)?;
            let target = if target.is_empty() || storage.is_dir(&target).await? {
                let name = file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .with_context(|| format!("Invalid file name: {}", file.display()))?;
                path::join(&target, name)
            } else {
                target
            };
            let local = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("Failed to open {}", file.display()))?;
            let size = local.metadata().await?.len();
            let written = storage.write_stream(&target, Box::pin(local), Some(size)).await?;
            eprintln!("wrote {} bytes to {}", written, target);
        }
        Command::Stat { address } => {
            let (storage, file) = mounts.resolve(&address)?;
            let Some(meta) = storage.get_meta_data(&file).await? else {
                bail!("not found: {}", address);
            };
            println!("{}", serde_json::to_string_pretty(&meta)?);
        }
        Command::Rm { address } => {
            let (storage, file) = mounts.resolve(&address)?;
            if !storage.remove(&file).await? {
                bail!("could not remove {}", address);
            }
        }
        Command::Mkdir { address, parents } => {
            let (storage, dir) = mounts.resolve(&address)?;
            if parents {
                let clean = path::normalize(&dir)?;
                let mut current = String::new();
                for segment in clean.split('/').filter(|s| !s.is_empty()) {
                    current = path::join(&current, segment);
                    if !storage.is_dir(&current).await? && !storage.mkdir(&current).await? {
                        bail!("could not create {}", current);
                    }
                }
            } else if !storage.mkdir(&dir).await? {
                bail!("could not create {}", address);
            }
        }
        Command::Cp { source, target } => {
            let (from, from_path) = mounts.resolve(&source)?;
            let (to, to_path) = mounts.resolve(&target)?;
            if !to
                .copy_from_storage(from.as_ref(), &from_path, &to_path, true)
                .await?
            {
                bail!("could not copy {} to {}", source, target);
            }
        }
        Command::Mv { source, target } => {
            let (from, from_path) = mounts.resolve(&source)?;
            let (to, to_path) = mounts.resolve(&target)?;
            if !to
                .move_from_storage(from.as_ref(), &from_path, &to_path)
                .await?
            {
                bail!("could not move {} to {}", source, target);
            }
        }
        Command::Search { mount, query } => {
            let (storage, _) = mounts.resolve(&format!("{}:", mount.trim_end_matches(':')))?;
            for hit in storage.search(&query).await? {
                println!("{}:{}", mount.trim_end_matches(':'), hit);
            }
        }
        Command::Hash { address, algorithm } => {
            let (storage, file) = mounts.resolve(&address)?;
            let digest = storage.hash(&file, algorithm, false).await?;
            println!("{}  {}", String::from_utf8_lossy(&digest), address);
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn mounts() -> Mounts {
        let config: CliConfig = serde_json::from_str(
            r#"{ "mounts": [
                { "mount_point": "a", "backend": { "type": "memory", "id": "a" } },
                { "mount_point": "b", "backend": { "type": "memory", "id": "b" } }
            ] }"#,
        )
        .unwrap();
        Mounts::mount(config).unwrap()
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["storagekit", "hash", "-a", "md5", "a:x"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Hash { algorithm: HashAlgorithm::Md5, .. }
        ));
        assert!(Args::try_parse_from(["storagekit", "hash", "-a", "crc", "a:x"]).is_err());
    }

    #[tokio::test]
    async fn test_copy_and_move_across_mounts() {
        let mounts = mounts();
        let (a, _) = mounts.resolve("a:").unwrap();
        a.write_all("doc.txt", b"content").await.unwrap();

        run(&mounts, Command::Cp { source: "a:doc.txt".into(), target: "b:copy.txt".into() })
            .await
            .unwrap();
        run(&mounts, Command::Mv { source: "a:doc.txt".into(), target: "b:moved.txt".into() })
            .await
            .unwrap();

        let (b, _) = mounts.resolve("b:").unwrap();
        assert_eq!(b.read_all("copy.txt").await.unwrap(), b"content");
        assert_eq!(b.read_all("moved.txt").await.unwrap(), b"content");
        assert!(!a.file_exists("doc.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_mkdir_parents_and_put() {
        let mounts = mounts();
        run(&mounts, Command::Mkdir { address: "a:x/y/z".into(), parents: true })
            .await
            .unwrap();
        let (a, _) = mounts.resolve("a:").unwrap();
        assert!(a.is_dir("x/y/z").await.unwrap());

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("upload.bin");
        std::fs::write(&local, b"bytes").unwrap();
        run(&mounts, Command::Put { file: local, address: "a:x/y".into() })
            .await
            .unwrap();
        assert_eq!(a.read_all("x/y/upload.bin").await.unwrap(), b"bytes");
    }

    #[tokio::test]
    async fn test_rm_missing_fails() {
        let mounts = mounts();
        assert!(run(&mounts, Command::Rm { address: "a:ghost".into() }).await.is_err());
    }
}
