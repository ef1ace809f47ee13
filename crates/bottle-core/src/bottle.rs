//! Bottle identity: absolute path, stable hash, mapper name and metadata path.

use crate::error::{BottleError, BottleResult};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

pub const BOTTLE_EXTENSION: &str = "bottle";
pub const MAPPER_PREFIX: &str = "bottle-";
const IDENTITY_HEX_LEN: usize = 12;
const LABEL_MAX_LEN: usize = 16;

/// An encrypted container file plus the names derived from its absolute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BottleContainer {
    file_path: PathBuf,
    identity_hash: String,
    mapper_name: String,
    config_path: PathBuf,
}

impl BottleContainer {
    /// Derive identity for `path`, storing metadata under `config_dir`.
    ///
    /// The path does not need to exist yet (creation goes through here too),
    /// but its parent directory must.
    pub fn new(path: &Path, config_dir: &Path) -> BottleResult<Self> {
        let file_path = absolute_path(path)?;
        let identity_hash = identity_hash(&file_path);
        let mapper_name = format!("{MAPPER_PREFIX}{identity_hash}");
        let config_path = config_dir.join(format!("{identity_hash}.conf"));
        Ok(Self {
            file_path,
            identity_hash,
            mapper_name,
            config_path,
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn identity_hash(&self) -> &str {
        &self.identity_hash
    }

    pub fn mapper_name(&self) -> &str {
        &self.mapper_name
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// File stem without the `.bottle` extension.
    pub fn name(&self) -> String {
        self.file_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Filesystem label: the bottle name truncated to what ext4 accepts.
    pub fn fs_label(&self) -> String {
        self.name().chars().take(LABEL_MAX_LEN).collect()
    }
}

/// First twelve hex digits of the SHA-256 of the absolute path.
pub fn identity_hash(path: &Path) -> String {
    let digest = Sha256::digest(path.as_os_str().as_encoded_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(IDENTITY_HEX_LEN);
    hex
}

fn absolute_path(path: &Path) -> BottleResult<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(BottleError::InvalidConfig("empty bottle path".into()));
    }
    if path.exists() {
        return Ok(fs::canonicalize(path)?);
    }

    let file_name = path.file_name().ok_or_else(|| {
        BottleError::InvalidConfig(format!("{} does not name a file", path.display()))
    })?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok(fs::canonicalize(parent)?.join(file_name))
}

/// Resolve a user-supplied name against `bottle_dir`, appending `.bottle`
/// when missing. Anything containing a separator is taken as a path.
pub fn normalize_bottle_path(input: &str, bottle_dir: &Path) -> PathBuf {
    let mut path = if input.contains('/') {
        PathBuf::from(input)
    } else {
        bottle_dir.join(input)
    };
    if path.extension().and_then(|ext| ext.to_str()) != Some(BOTTLE_EXTENSION) {
        let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".");
        name.push(BOTTLE_EXTENSION);
        path.set_file_name(name);
    }
    path
}

/// Every `*.bottle` regular file in `dir`, sorted by name. A missing
/// directory yields an empty list.
pub fn list_bottles(dir: &Path) -> BottleResult<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut bottles = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|ext| ext.to_str()) == Some(BOTTLE_EXTENSION)
        {
            bottles.push(path);
        }
    }
    bottles.sort();
    Ok(bottles)
}

const MAX_SIZE_FRACTION_DIGITS: usize = 9;

/// Parse sizes like `500M`, `1.5G` or `1048576` into bytes.
///
/// Fractions are computed exactly and rounded half up to the nearest byte.
pub fn parse_size(input: &str) -> BottleResult<u64> {
    let trimmed = input.trim();
    let invalid = || BottleError::InvalidConfig(format!("invalid size `{input}`"));
    if trimmed.is_empty() {
        return Err(invalid());
    }

    let (number, multiplier) = match trimmed.char_indices().last() {
        Some((idx, suffix)) if suffix.is_ascii_alphabetic() => {
            let multiplier: u64 = match suffix.to_ascii_uppercase() {
                'K' => 1 << 10,
                'M' => 1 << 20,
                'G' => 1 << 30,
                'T' => 1 << 40,
                _ => return Err(invalid()),
            };
            (trimmed[..idx].trim(), multiplier)
        }
        _ => (trimmed, 1),
    };

    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
    if (whole.is_empty() && fraction.is_empty())
        || !all_digits(whole)
        || !all_digits(fraction)
        || fraction.len() > MAX_SIZE_FRACTION_DIGITS
    {
        return Err(invalid());
    }

    let whole: u64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let mut bytes = whole.checked_mul(multiplier).ok_or_else(invalid)?;
    if !fraction.is_empty() {
        let scale = 10u128.pow(fraction.len() as u32);
        let digits: u128 = fraction.parse().map_err(|_| invalid())?;
        let numerator = digits * u128::from(multiplier);
        let rounded = (numerator * 2 + scale) / (scale * 2);
        let extra = u64::try_from(rounded).map_err(|_| invalid())?;
        bytes = bytes.checked_add(extra).ok_or_else(invalid)?;
    }
    if bytes == 0 {
        return Err(invalid());
    }
    Ok(bytes)
}
