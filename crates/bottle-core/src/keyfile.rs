//! Short-lived key files for handing raw key material to privileged tools.
//!
//! Key bytes never appear on a command line. Tools that need them get a path
//! to a 0600 file that is overwritten with zeros and unlinked as soon as the
//! call returns.

use crate::error::BottleResult;
use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::{Builder, NamedTempFile};
use zeroize::Zeroizing;

/// Raw key bytes that are wiped when dropped.
pub type KeyMaterial = Zeroizing<Vec<u8>>;

/// Key file that lives for the duration of one tool invocation.
pub struct StagedKeyFile {
    file: NamedTempFile,
    len: usize,
}

impl StagedKeyFile {
    /// Write `key` to a fresh private file under the system temp directory.
    pub fn stage(key: &[u8]) -> BottleResult<Self> {
        Self::stage_in(&std::env::temp_dir(), key)
    }

    pub fn stage_in(dir: &Path, key: &[u8]) -> BottleResult<Self> {
        let mut file = Builder::new().prefix(".bottle-key-").tempfile_in(dir)?;
        fs::set_permissions(file.path(), fs::Permissions::from_mode(0o600))?;
        file.as_file_mut().write_all(key)?;
        file.as_file_mut().flush()?;
        file.as_file().sync_all()?;
        Ok(Self {
            file,
            len: key.len(),
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

impl Drop for StagedKeyFile {
    fn drop(&mut self) {
        let handle = self.file.as_file_mut();
        if handle.seek(SeekFrom::Start(0)).is_ok() {
            let zeros = Zeroizing::new(vec![0u8; self.len]);
            let _ = handle.write_all(&zeros);
            let _ = handle.sync_all();
        }
        // NamedTempFile unlinks on its own drop.
    }
}
