//! Parsers and failure classifiers for udisksctl, losetup and lsblk output.
//!
//! None of these tools version their human-readable output. Every string
//! match lives in this file next to a test built from captured output, so a
//! format change means touching one function and one fixture.

use bottle_core::error::BottleError;
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Substrings in `udisksctl unlock` diagnostics that mean the key was wrong.
/// Matched case-sensitively; anything else is treated as fatal.
pub const WRONG_CREDENTIAL_PHRASES: &[&str] =
    &["Failed to activate device", "No key available", "passphrase"];

/// Substring in `udisksctl mount` diagnostics that marks a stale mapping.
pub const STALE_DEVICE_PHRASE: &str = "Error looking up object for device";

fn loop_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/dev/loop\d+").expect("valid device regex"))
}

fn dm_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/dev/dm-\d+").expect("valid device regex"))
}

fn mount_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^Mounted \S+ at (/.*?)\.?\s*$").expect("valid mount regex")
    })
}

/// `Mapped file /x.bottle as /dev/loop7.` -> `/dev/loop7`
///
/// The last match wins so a file path that happens to contain a loop node
/// name cannot shadow the assigned device.
pub fn parse_loop_device(output: &str) -> Option<String> {
    loop_regex().find_iter(output).last().map(|m| m.as_str().to_string())
}

/// `Unlocked /dev/loop7 as /dev/dm-3.` -> `/dev/dm-3`
pub fn parse_cleartext_device(output: &str) -> Option<String> {
    dm_regex().find_iter(output).last().map(|m| m.as_str().to_string())
}

/// `Mounted /dev/dm-3 at /media/me/my work.` -> `/media/me/my work`
///
/// Everything after ` at ` on the `Mounted` line is the path, spaces
/// included; only udisks' closing period is dropped.
pub fn parse_mount_point(output: &str) -> Option<PathBuf> {
    let captures = mount_regex().captures(output)?;
    captures.get(1).map(|path| PathBuf::from(path.as_str()))
}

/// Classify a failed unlock. Only the known phrases are recoverable.
pub fn classify_unlock_failure(operation: &str, diagnostic: &str) -> BottleError {
    if WRONG_CREDENTIAL_PHRASES
        .iter()
        .any(|phrase| diagnostic.contains(phrase))
    {
        BottleError::WrongCredential {
            operation: operation.to_string(),
            diagnostic: diagnostic.to_string(),
        }
    } else {
        BottleError::tool(operation, diagnostic)
    }
}

/// Classify a failed mount, singling out the stale-mapping case.
pub fn classify_mount_failure(operation: &str, diagnostic: &str) -> BottleError {
    if diagnostic.contains(STALE_DEVICE_PHRASE) {
        BottleError::StaleDevice {
            operation: operation.to_string(),
            diagnostic: diagnostic.to_string(),
        }
    } else {
        BottleError::tool(operation, diagnostic)
    }
}

/// `losetup -j FILE` prints `/dev/loop7: []: (/path/x.bottle)`; take the
/// device from the first line.
pub fn parse_losetup_association(output: &str) -> Option<String> {
    let line = output.lines().map(str::trim).find(|line| !line.is_empty())?;
    let (device, _) = line.split_once(':')?;
    let device = device.trim();
    if device.is_empty() {
        None
    } else {
        Some(device.to_string())
    }
}

/// Row of `lsblk -nlpo NAME,KNAME,TYPE` describing a crypt child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptChild {
    /// `/dev/mapper/...` name, as it usually appears in the mount table.
    pub name: String,
    /// Kernel node, e.g. `/dev/dm-3`.
    pub kname: String,
}

pub fn parse_lsblk_crypt(output: &str) -> Option<CryptChild> {
    output.lines().find_map(|line| {
        let mut cols = line.split_whitespace();
        let name = cols.next()?;
        let kname = cols.next()?;
        let kind = cols.next()?;
        (kind == "crypt").then(|| CryptChild {
            name: name.to_string(),
            kname: kname.to_string(),
        })
    })
}
