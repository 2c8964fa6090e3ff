//! Turning the staging tree into the final archive.
//!
//! The tree is packed into an uncompressed tarball inside the private
//! staging directory, streamed through the selected encoder into
//! `<output>.part`, and renamed over `<output>` only once the encoder has
//! flushed and the checksum sidecar is written. A reader never sees a
//! half-written archive at the final path.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

use crate::archive::staging::StagingArchive;
use crate::config::Compression;
use crate::constants::COMPRESSION_CHUNK_SIZE;
use crate::utils::hash::write_checksum_sidecar;

/// A finished archive and its checksum.
#[derive(Debug, Clone)]
pub struct FinalArchive {
    pub path: PathBuf,
    pub compression: Compression,
    pub size: u64,
    pub checksum: String,
    pub checksum_path: PathBuf,
}

/// Default archive location: `<dir>/<name>.<ext>`.
pub fn default_output_path(dir: &Path, name: &str, compression: Compression) -> PathBuf {
    dir.join(format!("{}.{}", name, compression.resolve().extension()))
}

fn part_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

/// Pack `root` as `<name>/...` into an uncompressed tarball. Symlinks are
/// stored as links.
fn build_tarball(root: &Path, name: &str, tar_path: &Path) -> Result<()> {
    let file = File::create(tar_path)
        .context(format!("Failed to create {}", tar_path.display()))?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(name, root)
        .context("Failed to add staging tree to tarball")?;
    builder
        .into_inner()
        .context("Failed to finish tarball")?
        .sync_all()
        .context("Failed to sync tarball")?;
    Ok(())
}

async fn encode<W: AsyncWrite + Unpin>(mut writer: W, tar_path: &Path) -> io::Result<u64> {
    let input = tokio::fs::File::open(tar_path).await?;
    let mut reader = BufReader::with_capacity(COMPRESSION_CHUNK_SIZE, input);
    let copied = tokio::io::copy(&mut reader, &mut writer).await?;
    writer.shutdown().await?;
    Ok(copied)
}

async fn write_compressed(tar_path: &Path, part: &Path, compression: Compression) -> io::Result<u64> {
    let out = BufWriter::with_capacity(
        COMPRESSION_CHUNK_SIZE,
        tokio::fs::File::create(part).await?,
    );

    match compression {
        #[cfg(feature = "gzip")]
        Compression::Gzip => encode(async_compression::tokio::write::GzipEncoder::new(out), tar_path).await,
        #[cfg(feature = "xz")]
        Compression::Xz => encode(async_compression::tokio::write::XzEncoder::new(out), tar_path).await,
        #[cfg(feature = "zstd")]
        Compression::Zstd => encode(async_compression::tokio::write::ZstdEncoder::new(out), tar_path).await,
        _ => encode(out, tar_path).await,
    }
}

impl StagingArchive {
    /// Produce the archive at `output` and remove the staging tree.
    ///
    /// On failure the partial output is deleted and the tree is left for the
    /// caller to preserve or remove.
    pub async fn finalize(&self, output: &Path, compression: Compression) -> Result<FinalArchive> {
        let start = Instant::now();
        let compression = compression.resolve();
        info!("Finalizing archive {} ({})", output.display(), compression.as_str());

        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context(format!("Failed to create {}", parent.display()))?;
            }
        }

        let tar_path = self.private_dir().join(format!("{}.tar", self.name()));
        let root = self.root().to_path_buf();
        let name = self.name().to_string();
        let tar_for_builder = tar_path.clone();
        tokio::task::spawn_blocking(move || build_tarball(&root, &name, &tar_for_builder))
            .await
            .context("Tarball builder panicked")??;

        let part = part_path(output);
        let written = match write_compressed(&tar_path, &part, compression).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                return Err(e).context(format!("Failed to write {}", part.display()));
            }
        };

        // Sidecar first: a published archive always has its checksum beside it
        let hashed = part.clone();
        let published = output.to_path_buf();
        let sidecar = tokio::task::spawn_blocking(move || write_checksum_sidecar(&hashed, &published))
            .await
            .context("Checksum worker panicked")?;
        let (checksum_path, checksum) = match sidecar {
            Ok(sidecar) => sidecar,
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                return Err(e).context("Failed to write archive checksum");
            }
        };

        if let Err(e) = tokio::fs::rename(&part, output).await {
            let _ = tokio::fs::remove_file(&part).await;
            let _ = tokio::fs::remove_file(&checksum_path).await;
            return Err(e).context(format!("Failed to move archive into place at {}", output.display()));
        }

        let size = tokio::fs::metadata(output).await.map(|m| m.len()).unwrap_or(0);
        debug!("Packed {} tar bytes into {} archive bytes in {:?}", written, size, start.elapsed());

        if let Err(e) = self.remove_tree() {
            warn!("Archive written but staging tree could not be removed: {}", e);
        }

        info!("Archive written: {} ({} bytes)", output.display(), size);
        Ok(FinalArchive {
            path: output.to_path_buf(),
            compression,
            size,
            checksum,
            checksum_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn entries(tar_bytes: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(tar_bytes);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_finalize_plain_tar() {
        let base = TempDir::new().unwrap();
        let staging = StagingArchive::create(base.path(), "myhost-1").unwrap();
        staging.add_string("host", b"127.0.0.1 localhost\n", "etc/hosts").unwrap();
        staging.add_link("host", "/hosts", "etc/hosts", "hosts").unwrap();

        let output = base.path().join("out/myhost-1.tar");
        let archive = staging.finalize(&output, Compression::None).await.unwrap();

        assert_eq!(archive.compression, Compression::None);
        assert!(output.exists());
        assert!(!part_path(&output).exists());
        assert!(!staging.private_dir().exists());
        assert!(archive.checksum_path.exists());

        let bytes = std::fs::read(&output).unwrap();
        let names = entries(&bytes);
        assert!(names.iter().any(|n| n == "myhost-1/etc/hosts"));
        assert!(names.iter().any(|n| n == "myhost-1/hosts"));
        assert!(names.iter().any(|n| n.starts_with("myhost-1/sos_reports")));
    }

    #[cfg(feature = "gzip")]
    #[tokio::test]
    async fn test_finalize_gzip_round_trips() {
        let base = TempDir::new().unwrap();
        let staging = StagingArchive::create(base.path(), "gz").unwrap();
        staging.add_string("host", b"hello", "etc/motd").unwrap();

        let output = base.path().join("gz.tar.gz");
        let archive = staging.finalize(&output, Compression::Gzip).await.unwrap();
        assert_eq!(archive.compression, Compression::Gzip);

        let compressed = std::fs::read(&output).unwrap();
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);

        let mut decoder = async_compression::tokio::bufread::GzipDecoder::new(&compressed[..]);
        let mut tar_bytes = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut decoder, &mut tar_bytes).await.unwrap();

        let mut archive = tar::Archive::new(&tar_bytes[..]);
        let mut found = false;
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().to_string_lossy() == "gz/etc/motd" {
                let mut content = String::new();
                entry.read_to_string(&mut content).unwrap();
                assert_eq!(content, "hello");
                found = true;
            }
        }
        assert!(found);
    }

    #[tokio::test]
    async fn test_checksum_failure_publishes_nothing() {
        let base = TempDir::new().unwrap();
        let staging = StagingArchive::create(base.path(), "blocked").unwrap();
        staging.add_string("host", b"x", "etc/motd").unwrap();

        let output = base.path().join("blocked.tar");
        // A directory where the sidecar should go makes the checksum write fail.
        std::fs::create_dir(base.path().join("blocked.tar.sha256")).unwrap();

        assert!(staging.finalize(&output, Compression::None).await.is_err());
        assert!(!output.exists());
        assert!(!part_path(&output).exists());
        assert!(staging.private_dir().exists());
    }

    #[test]
    fn test_default_output_path() {
        let path = default_output_path(Path::new("/var/tmp"), "host-1", Compression::None);
        assert_eq!(path, PathBuf::from("/var/tmp/host-1.tar"));
    }
}
