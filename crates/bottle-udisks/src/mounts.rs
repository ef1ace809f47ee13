//! Mount-table lookup for cleartext devices.

use bottle_core::error::BottleResult;
use std::fs;
use std::path::{Path, PathBuf};

pub const MOUNTS_OVERRIDE_ENV: &str = "BOTTLE_MOUNTS_PATH";
pub const DEFAULT_MOUNTS_PATH: &str = "/proc/mounts";

/// Mount point of the first entry whose source is any of `sources`.
///
/// Sources are compared verbatim and after resolving symlinks, since the
/// table may list `/dev/mapper/luks-…` while the probe knows `/dev/dm-3`.
pub(crate) fn find_mount_point(table: &Path, sources: &[&str]) -> BottleResult<Option<PathBuf>> {
    let mounts = fs::read_to_string(table)?;
    Ok(parse_mounts(&mounts, sources))
}

/// Whether any entry in `table` is mounted at exactly `mount_point`.
pub(crate) fn is_mount_target(table: &Path, mount_point: &Path) -> BottleResult<bool> {
    let mounts = fs::read_to_string(table)?;
    Ok(lists_target(&mounts, mount_point))
}

fn lists_target(mounts: &str, mount_point: &Path) -> bool {
    mounts.lines().any(|line| {
        line.split_whitespace()
            .nth(1)
            .map(|target| Path::new(&unescape_mount_field(target)) == mount_point)
            .unwrap_or(false)
    })
}

fn parse_mounts(mounts: &str, sources: &[&str]) -> Option<PathBuf> {
    let resolved: Vec<PathBuf> = sources
        .iter()
        .filter_map(|source| fs::canonicalize(source).ok())
        .collect();

    for line in mounts.lines() {
        let mut parts = line.split_whitespace();
        let (Some(device), Some(mountpoint)) = (parts.next(), parts.next()) else {
            continue;
        };
        let device = unescape_mount_field(device);
        let matches = sources.iter().any(|source| *source == device)
            || fs::canonicalize(&device)
                .map(|dev| resolved.contains(&dev))
                .unwrap_or(false);
        if matches {
            return Some(PathBuf::from(unescape_mount_field(mountpoint)));
        }
    }
    None
}

/// Undo the kernel's octal escaping (`\040` for space and friends).
fn unescape_mount_field(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut idx = 0;

    while idx < bytes.len() {
        if bytes[idx] == b'\\' {
            if let Some(value) = input
                .get(idx + 1..idx + 4)
                .filter(|oct| oct.bytes().all(|b| (b'0'..=b'7').contains(&b)))
                .and_then(|oct| u8::from_str_radix(oct, 8).ok())
            {
                output.push(value);
                idx += 4;
                continue;
            }
        }
        output.push(bytes[idx]);
        idx += 1;
    }

    String::from_utf8_lossy(&output).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn finds_mapper_entry_with_escaped_path() {
        let snapshot = "sysfs /sys sysfs rw 0 0\n/dev/mapper/luks-0f1e /media/me/My\\040Work ext4 rw,nosuid,nodev,noexec 0 0\n";
        let mount = parse_mounts(snapshot, &["/dev/dm-3", "/dev/mapper/luks-0f1e"]).unwrap();
        assert_eq!(mount, PathBuf::from("/media/me/My Work"));
    }

    #[test]
    fn mount_target_must_match_whole_path() {
        let snapshot = "/dev/mapper/luks-0f1e /run/media/me/my\\040work ext4 rw 0 0\n";
        assert!(lists_target(snapshot, Path::new("/run/media/me/my work")));
        assert!(!lists_target(snapshot, Path::new("/run/media/me/my")));
        assert!(!lists_target("", Path::new("/run/media/me/my work")));
    }

    #[test]
    fn unrelated_devices_do_not_match() {
        let snapshot = "/dev/dm-1 /home ext4 rw 0 0\n";
        assert_eq!(parse_mounts(snapshot, &["/dev/dm-3"]), None);
        assert_eq!(parse_mounts("garbage\n\n", &["/dev/dm-3"]), None);
    }

    #[test]
    fn reads_table_from_given_path() {
        let dir = tempdir().unwrap();
        let table = dir.path().join("mounts");
        fs::write(&table, "/dev/dm-7 /media/me/bottle ext4 rw 0 0\n").unwrap();
        assert_eq!(
            find_mount_point(&table, &["/dev/dm-7"]).unwrap(),
            Some(PathBuf::from("/media/me/bottle"))
        );
    }

    #[test]
    fn unescape_decodes_octals_only() {
        assert_eq!(unescape_mount_field("/media/a\\040b"), "/media/a b");
        assert_eq!(unescape_mount_field("/media/tab\\011x"), "/media/tab\tx");
        assert_eq!(unescape_mount_field("/mnt/keys"), "/mnt/keys");
        assert_eq!(unescape_mount_field("/mnt/odd\\9"), "/mnt/odd\\9");
    }
}
