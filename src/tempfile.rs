//! Tempfile layout for multipart file uploads.
//!
//! Names each spill file from a host, pid, timestamp, and content hash so
//! it's both collision-free and inspectable from outside the process.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

const MAX_NAME_LEN: usize = 255;

fn tempfile_root() -> PathBuf {
    let base = shellexpand::env("$TMPDIR").unwrap_or(std::borrow::Cow::Borrowed("/tmp"));
    Path::new(base.as_ref()).join("mosh-fcgi")
}

fn ensure_root_dir() -> Result<PathBuf> {
    let root = tempfile_root();
    std::fs::create_dir_all(&root).map_err(Error::Io)?;
    let mut perms = std::fs::metadata(&root)?.permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o700);
    std::fs::set_permissions(&root, perms)?;
    Ok(root)
}

/// Build (but do not create) the tempfile path for one multipart file
/// entry: `$TMPDIR/mosh-fcgi/$host.$pid-$timestamp-$sha1hex`, truncated to
/// 255 characters.
fn build_name(headers_blob: &[u8], filename: &str, content_type: &str) -> String {
    let host = hostname();
    let pid = std::process::id();
    let now = chrono::Utc::now().format("%Y%m%d.%H%M%S%6f");

    let mut hasher = Sha1::new();
    hasher.update(headers_blob);
    hasher.update(filename.as_bytes());
    hasher.update(content_type.as_bytes());
    let digest = hex::encode(hasher.finalize());

    let name = format!("{host}.{pid}-{now}-{digest}");
    if name.len() > MAX_NAME_LEN {
        name[..MAX_NAME_LEN].to_string()
    } else {
        name
    }
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|n| n.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// A tempfile backing one uploaded multipart entry. Unlinked on drop
/// unless [`TempFile::make_persistent`] was called.
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
    file: Option<File>,
    persistent: bool,
}

impl TempFile {
    pub fn create(headers_blob: &[u8], filename: &str, content_type: &str) -> Result<Self> {
        let root = ensure_root_dir()?;
        let path = root.join(build_name(headers_blob, filename, content_type));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| Error::Tempfile(format!("{}: {e}", path.display())))?;
        Ok(TempFile {
            path,
            file: Some(file),
            persistent: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.file
            .as_mut()
            .expect("tempfile open")
            .write_all(bytes)
            .map_err(Error::Io)
    }

    /// Keep the file on disk past this handle's lifetime.
    pub fn make_persistent(&mut self) {
        self.persistent = true;
    }

    pub fn len(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        self.file = None;
        if !self.persistent {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
