//! Per-bottle metadata: sandbox permissions and credential mode.
//!
//! Files are newline-delimited `KEY=VALUE` pairs. Booleans are `1`/`0`,
//! strings are double-quoted with backslash escapes. Unknown keys and
//! malformed lines are skipped so a hand-edited file still loads.

use crate::error::{BottleError, BottleResult};
use bottle_provider::CredentialKind;
use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::NamedTempFile;

const KEY_LAST_APP: &str = "PREF_LAST_APP";
const KEY_BOTTLE_ID: &str = "FIDO2_BOTTLE_ID";
const KEY_CREDENTIAL_ID: &str = "FIDO2_CREDENTIAL_ID";
const KEY_SALT: &str = "FIDO2_SALT";
const KEY_DEVICE_HINT: &str = "FIDO2_DEVICE_HINT";

/// One sandbox capability toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Network,
    Audio,
    Gpu,
    Wayland,
    X11,
    Camera,
    Portals,
}

impl Permission {
    pub const ALL: [Permission; 7] = [
        Permission::Network,
        Permission::Audio,
        Permission::Gpu,
        Permission::Wayland,
        Permission::X11,
        Permission::Camera,
        Permission::Portals,
    ];

    fn config_key(self) -> &'static str {
        match self {
            Permission::Network => "PREF_NETWORK",
            Permission::Audio => "PREF_AUDIO",
            Permission::Gpu => "PREF_GPU",
            Permission::Wayland => "PREF_WAYLAND",
            Permission::X11 => "PREF_X11",
            Permission::Camera => "PREF_CAMERA",
            Permission::Portals => "PREF_PORTALS",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Permission::Network => "network",
            Permission::Audio => "audio",
            Permission::Gpu => "gpu",
            Permission::Wayland => "wayland",
            Permission::X11 => "x11",
            Permission::Camera => "camera",
            Permission::Portals => "portals",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Permission::ALL
            .into_iter()
            .find(|perm| perm.name().eq_ignore_ascii_case(name.trim()))
    }
}

/// Capability flags handed to the sandbox runtime, plus the last app run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionSet {
    pub network: bool,
    pub audio: bool,
    pub gpu: bool,
    pub wayland: bool,
    pub x11: bool,
    pub camera: bool,
    pub portals: bool,
    pub last_app: String,
}

impl Default for PermissionSet {
    fn default() -> Self {
        Self {
            network: true,
            audio: true,
            gpu: true,
            wayland: true,
            x11: true,
            camera: false,
            portals: false,
            last_app: String::new(),
        }
    }
}

impl PermissionSet {
    pub fn get(&self, perm: Permission) -> bool {
        match perm {
            Permission::Network => self.network,
            Permission::Audio => self.audio,
            Permission::Gpu => self.gpu,
            Permission::Wayland => self.wayland,
            Permission::X11 => self.x11,
            Permission::Camera => self.camera,
            Permission::Portals => self.portals,
        }
    }

    pub fn set(&mut self, perm: Permission, value: bool) {
        let slot = match perm {
            Permission::Network => &mut self.network,
            Permission::Audio => &mut self.audio,
            Permission::Gpu => &mut self.gpu,
            Permission::Wayland => &mut self.wayland,
            Permission::X11 => &mut self.x11,
            Permission::Camera => &mut self.camera,
            Permission::Portals => &mut self.portals,
        };
        *slot = value;
    }

    /// Flip `perm` and return the new value.
    pub fn toggle(&mut self, perm: Permission) -> bool {
        let next = !self.get(perm);
        self.set(perm, next);
        next
    }

    /// Comma-separated list of enabled capabilities, or `none`.
    pub fn summary(&self) -> String {
        let enabled: Vec<&str> = Permission::ALL
            .into_iter()
            .filter(|perm| self.get(*perm))
            .map(Permission::name)
            .collect();
        if enabled.is_empty() {
            "none".to_string()
        } else {
            enabled.join(", ")
        }
    }
}

/// Persisted identity of a hardware-key credential. Never holds the secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareKeyBinding {
    /// Base64 random 32 bytes; challenge and user handle for every operation.
    pub bottle_id: String,
    pub credential_id: String,
    /// Base64 random 32 bytes fed to hmac-secret.
    pub salt: String,
    /// Last authenticator path seen. Advisory only.
    pub device_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Credential {
    #[default]
    Password,
    HardwareKey(HardwareKeyBinding),
}

impl Credential {
    pub fn kind(&self) -> CredentialKind {
        match self {
            Credential::Password => CredentialKind::Password,
            Credential::HardwareKey(_) => CredentialKind::HardwareKey,
        }
    }
}

/// Everything stored for one bottle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BottleMetadata {
    pub permissions: PermissionSet,
    pub credential: Credential,
}

/// Classify the hardware-key fields found in a config file.
///
/// All three present means hardware key, none present means password; any
/// other mix is reported back as the reason the file is corrupted.
pub fn detect_credential(
    bottle_id: Option<String>,
    credential_id: Option<String>,
    salt: Option<String>,
    device_hint: Option<String>,
) -> Result<Credential, String> {
    let present = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.is_empty());
    match (bottle_id, credential_id, salt) {
        (Some(bottle_id), Some(credential_id), Some(salt))
            if !bottle_id.is_empty() && !credential_id.is_empty() && !salt.is_empty() =>
        {
            Ok(Credential::HardwareKey(HardwareKeyBinding {
                bottle_id,
                credential_id,
                salt,
                device_hint: device_hint.filter(|hint| !hint.is_empty()),
            }))
        }
        (bottle_id, credential_id, salt) => {
            let missing: Vec<&str> = [
                (KEY_BOTTLE_ID, present(&bottle_id)),
                (KEY_CREDENTIAL_ID, present(&credential_id)),
                (KEY_SALT, present(&salt)),
            ]
            .into_iter()
            .filter(|(_, set)| !set)
            .map(|(key, _)| key)
            .collect();
            if missing.len() == 3 {
                Ok(Credential::Password)
            } else {
                Err(format!(
                    "partial hardware-key credential: missing {}",
                    missing.join(", ")
                ))
            }
        }
    }
}

/// Read metadata from `path`. A missing file yields defaults.
pub fn load(path: &Path) -> BottleResult<BottleMetadata> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(BottleMetadata::default())
        }
        Err(err) => return Err(err.into()),
    };

    let mut permissions = PermissionSet::default();
    let mut bottle_id = None;
    let mut credential_id = None;
    let mut salt = None;
    let mut device_hint = None;

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        if let Some(perm) = Permission::ALL
            .into_iter()
            .find(|perm| perm.config_key() == key)
        {
            permissions.set(perm, parse_bool(value));
            continue;
        }

        match key {
            KEY_LAST_APP => permissions.last_app = unquote(value),
            KEY_BOTTLE_ID => bottle_id = Some(unquote(value)),
            KEY_CREDENTIAL_ID => credential_id = Some(unquote(value)),
            KEY_SALT => salt = Some(unquote(value)),
            KEY_DEVICE_HINT => device_hint = Some(unquote(value)),
            _ => {}
        }
    }

    let credential = detect_credential(bottle_id, credential_id, salt, device_hint).map_err(
        |reason| BottleError::CorruptedConfig {
            path: path.to_path_buf(),
            reason,
        },
    )?;

    Ok(BottleMetadata {
        permissions,
        credential,
    })
}

/// Durably replace `path` with `metadata`.
///
/// Writes a sibling temp file, fsyncs it, renames it over the target and
/// fsyncs the parent directory so the rename survives power loss.
pub fn save(path: &Path, metadata: &BottleMetadata) -> BottleResult<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let payload = render(metadata);
    let mut temp = NamedTempFile::new_in(parent)?;
    temp.as_file_mut().write_all(payload.as_bytes())?;
    temp.as_file_mut().flush()?;
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o600))?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| BottleError::Io(err.error))?;
    sync_parent_dir(parent)?;
    Ok(())
}

/// Remove the metadata file if present.
pub fn remove(path: &Path) -> BottleResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn render(metadata: &BottleMetadata) -> String {
    let mut out = String::new();
    let perms = &metadata.permissions;
    for perm in Permission::ALL {
        let flag = if perms.get(perm) { 1 } else { 0 };
        let _ = writeln!(out, "{}={flag}", perm.config_key());
    }
    let _ = writeln!(out, "{KEY_LAST_APP}={}", quote(&perms.last_app));

    if let Credential::HardwareKey(binding) = &metadata.credential {
        let _ = writeln!(out, "{KEY_BOTTLE_ID}={}", quote(&binding.bottle_id));
        let _ = writeln!(out, "{KEY_CREDENTIAL_ID}={}", quote(&binding.credential_id));
        let _ = writeln!(out, "{KEY_SALT}={}", quote(&binding.salt));
        if let Some(hint) = binding.device_hint.as_deref().filter(|h| !h.is_empty()) {
            let _ = writeln!(out, "{KEY_DEVICE_HINT}={}", quote(hint));
        }
    }
    out
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true")
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

/// Strip surrounding quotes and undo escapes. Bare values pass through.
fn unquote(value: &str) -> String {
    let Some(inner) = value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    else {
        return value.to_string();
    };

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn sync_parent_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).and_then(|file| file.sync_all())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn binding(hint: Option<&str>) -> HardwareKeyBinding {
        HardwareKeyBinding {
            bottle_id: "q83vEjRWeJCrze8SNFZ4kKvN7xI0VniQq83vEjRWeJA=".into(),
            credential_id: "AQIDBAUGBwgJCgsMDQ4PEBESExQVFhcYGRobHB0eHyA=".into(),
            salt: "ESIzRFVmd4iZqrvM3e7/ABEiM0RVZneImaq7zN3u/wA=".into(),
            device_hint: hint.map(str::to_string),
        }
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempdir().unwrap();
        let meta = load(&dir.path().join("absent.conf")).unwrap();
        assert_eq!(meta, BottleMetadata::default());
        assert!(meta.permissions.network);
        assert!(!meta.permissions.camera);
        assert_eq!(meta.credential, Credential::Password);
    }

    #[test]
    fn password_round_trip_preserves_every_flag() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("abc.conf");
        let mut permissions = PermissionSet {
            network: false,
            audio: true,
            gpu: false,
            wayland: true,
            x11: false,
            camera: true,
            portals: true,
            last_app: "org.mozilla.firefox".into(),
        };
        permissions.toggle(Permission::Audio);
        let meta = BottleMetadata {
            permissions,
            credential: Credential::Password,
        };

        save(&path, &meta).unwrap();
        assert_eq!(load(&path).unwrap(), meta);
    }

    #[test]
    fn hardware_key_round_trip_with_and_without_hint() {
        let dir = tempdir().unwrap();
        for hint in [None, Some("/dev/hidraw4")] {
            let path = dir.path().join("hw.conf");
            let meta = BottleMetadata {
                permissions: PermissionSet::default(),
                credential: Credential::HardwareKey(binding(hint)),
            };
            save(&path, &meta).unwrap();
            assert_eq!(load(&path).unwrap(), meta);
        }
    }

    #[test]
    fn awkward_strings_survive_quoting() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("q.conf");
        let meta = BottleMetadata {
            permissions: PermissionSet {
                last_app: "say \"hi\"\\ =\tthere\n".into(),
                ..PermissionSet::default()
            },
            credential: Credential::Password,
        };
        save(&path, &meta).unwrap();
        assert_eq!(load(&path).unwrap(), meta);
    }

    #[test]
    fn save_restricts_permissions_and_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("perm.conf");
        save(&path, &BottleMetadata::default()).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn tolerates_junk_lines_and_legacy_booleans() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.conf");
        fs::write(
            &path,
            "# comment\n\nnot a pair\nPREF_NETWORK=0\nPREF_CAMERA=true\nUNKNOWN_KEY=7\nPREF_LAST_APP=org.gnome.Maps\n",
        )
        .unwrap();

        let meta = load(&path).unwrap();
        assert!(!meta.permissions.network);
        assert!(meta.permissions.camera);
        assert!(meta.permissions.audio);
        assert_eq!(meta.permissions.last_app, "org.gnome.Maps");
        assert_eq!(meta.credential, Credential::Password);
    }

    #[test]
    fn partial_hardware_key_fields_are_corrupted() {
        let full = [
            Some("bid".to_string()),
            Some("cid".to_string()),
            Some("salt".to_string()),
        ];
        for mask in 1u8..7 {
            let pick = |idx: usize| {
                if mask & (1 << idx) != 0 {
                    full[idx].clone()
                } else {
                    None
                }
            };
            let result = detect_credential(pick(0), pick(1), pick(2), Some("/dev/hidraw0".into()));
            assert!(result.is_err(), "mask {mask:#05b} must be rejected");
        }
        assert_eq!(
            detect_credential(None, None, None, Some("/dev/hidraw0".into())),
            Ok(Credential::Password)
        );
    }

    #[test]
    fn load_reports_partial_triple_with_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.conf");
        fs::write(&path, "FIDO2_BOTTLE_ID=\"abc\"\nFIDO2_SALT=\"def\"\n").unwrap();

        match load(&path).unwrap_err() {
            BottleError::CorruptedConfig { path: reported, reason } => {
                assert_eq!(reported, path);
                assert!(reason.contains("FIDO2_CREDENTIAL_ID"), "{reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn summary_lists_enabled_permissions() {
        let mut perms = PermissionSet::default();
        assert_eq!(perms.summary(), "network, audio, gpu, wayland, x11");
        for perm in Permission::ALL {
            perms.set(perm, false);
        }
        assert_eq!(perms.summary(), "none");
        assert_eq!(Permission::from_name("GPU"), Some(Permission::Gpu));
    }
}
