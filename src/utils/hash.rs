use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use sha2::{Sha256, Digest};

use crate::constants::DEFAULT_BUFFER_SIZE;

/// Calculate the SHA-256 of a file, streaming it through a 1MB buffer.
pub fn calculate_sha256(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; DEFAULT_BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Path of the checksum file that accompanies `archive`.
pub fn sidecar_path(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_os_string();
    name.push(".sha256");
    PathBuf::from(name)
}

/// Hash `content` and write `<published>.sha256` in the usual `sha256sum`
/// layout, naming `published`. `content` may still sit at a temporary path
/// that is renamed to `published` afterwards. Returns the sidecar path and
/// the digest.
pub fn write_checksum_sidecar(content: &Path, published: &Path) -> io::Result<(PathBuf, String)> {
    let digest = calculate_sha256(content)?;
    let file_name = published
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let sidecar = sidecar_path(published);
    std::fs::write(&sidecar, format!("{}  {}\n", digest, file_name))?;
    Ok((sidecar, digest))
}
