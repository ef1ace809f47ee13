//! Application configuration: where bottles live, which tools to run, retry knobs.

use crate::error::{BottleError, BottleResult};
use directories_next::{BaseDirs, ProjectDirs};
use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "BOTTLE_LAUNCH_CONFIG";
const BOTTLE_DIR_ENV: &str = "BOTTLE_DIR";
const CONFIG_FILE_NAME: &str = "bottle-launch.toml";
const APP_QUALIFIER: &str = "";
const APP_ORGANIZATION: &str = "";
const APP_NAME: &str = "bottle-launch";

pub const DEFAULT_FIDO2_RP_ID: &str = "bottle-launch";
pub const DEFAULT_FIDO2_USER: &str = "bottle-user";

pub(crate) fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
}

/// Storage locations for bottle files and per-bottle metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct PathsCfg {
    #[serde(default)]
    pub bottle_dir: Option<String>,

    #[serde(default)]
    pub config_dir: Option<String>,
}

/// How privileged helpers are invoked when the process is not root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Escalation {
    /// Prefer pkexec, fall back to sudo.
    #[default]
    Auto,
    Pkexec,
    Sudo,
    /// Run helpers directly.
    None,
}

/// Optional explicit paths for every external tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ToolsCfg {
    #[serde(default)]
    pub udisksctl: Option<String>,
    #[serde(default)]
    pub losetup: Option<String>,
    #[serde(default)]
    pub lsblk: Option<String>,
    #[serde(default)]
    pub cryptsetup: Option<String>,
    #[serde(default)]
    pub mkfs_ext4: Option<String>,
    #[serde(default)]
    pub sync: Option<String>,
    #[serde(default)]
    pub fido2_token: Option<String>,
    #[serde(default)]
    pub fido2_cred: Option<String>,
    #[serde(default)]
    pub fido2_assert: Option<String>,
    #[serde(default)]
    pub flatpak: Option<String>,
    #[serde(default)]
    pub escalation: Escalation,
}

/// Bounded waits used during teardown.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetryCfg {
    #[serde(default = "default_lock_attempts")]
    pub lock_attempts: u32,

    #[serde(default = "default_lock_delay_ms")]
    pub lock_delay_ms: u64,

    #[serde(default = "default_child_grace_ms")]
    pub child_grace_ms: u64,
}

fn default_lock_attempts() -> u32 {
    3
}

fn default_lock_delay_ms() -> u64 {
    500
}

fn default_child_grace_ms() -> u64 {
    200
}

impl Default for RetryCfg {
    fn default() -> Self {
        Self {
            lock_attempts: default_lock_attempts(),
            lock_delay_ms: default_lock_delay_ms(),
            child_grace_ms: default_child_grace_ms(),
        }
    }
}

/// Relying-party settings for hardware-key credentials.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Fido2Cfg {
    #[serde(default = "default_rp_id")]
    pub rp_id: String,

    #[serde(default = "default_user_name")]
    pub user_name: String,
}

fn default_rp_id() -> String {
    DEFAULT_FIDO2_RP_ID.to_string()
}

fn default_user_name() -> String {
    DEFAULT_FIDO2_USER.to_string()
}

impl Default for Fido2Cfg {
    fn default() -> Self {
        Self {
            rp_id: default_rp_id(),
            user_name: default_user_name(),
        }
    }
}

/// Top-level configuration snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct LaunchConfig {
    #[serde(default)]
    pub paths: PathsCfg,

    #[serde(default)]
    pub tools: ToolsCfg,

    #[serde(default)]
    pub retry: RetryCfg,

    #[serde(default)]
    pub fido2: Fido2Cfg,

    #[serde(skip)]
    pub path: PathBuf,
}

impl LaunchConfig {
    /// Per-user config file location, honouring `BOTTLE_LAUNCH_CONFIG`.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(path) = env::var_os(CONFIG_PATH_ENV).filter(|value| !value.is_empty()) {
            return Some(PathBuf::from(path));
        }
        project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Load `path` if it exists, otherwise fall back to defaults bound to `path`.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> BottleResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        debug!("no configuration at {}; using defaults", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            ..Self::default()
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> BottleResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut cfg = toml::from_str::<Self>(&contents)?;
        cfg.path = path.to_path_buf();
        Ok(cfg)
    }

    /// Best-effort validation pass returning human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.retry.lock_attempts == 0 {
            issues.push("retry.lock_attempts must be at least 1".to_string());
        }
        if self.fido2.rp_id.trim().is_empty() {
            issues.push("fido2.rp_id must not be empty".to_string());
        }
        if self.fido2.user_name.trim().is_empty() {
            issues.push("fido2.user_name must not be empty".to_string());
        }

        for (key, value) in [
            ("paths.bottle_dir", &self.paths.bottle_dir),
            ("paths.config_dir", &self.paths.config_dir),
        ] {
            if let Some(value) = value {
                if !Path::new(value.trim()).is_absolute() {
                    issues.push(format!("{key} must be an absolute path (got `{value}`)"));
                }
            }
        }

        for (key, value) in self.tool_overrides() {
            if !Path::new(value.trim()).is_absolute() {
                issues.push(format!("tools.{key} must be an absolute path (got `{value}`)"));
            }
        }

        issues
    }

    fn tool_overrides(&self) -> Vec<(&'static str, &String)> {
        let tools = &self.tools;
        [
            ("udisksctl", &tools.udisksctl),
            ("losetup", &tools.losetup),
            ("lsblk", &tools.lsblk),
            ("cryptsetup", &tools.cryptsetup),
            ("mkfs_ext4", &tools.mkfs_ext4),
            ("sync", &tools.sync),
            ("fido2_token", &tools.fido2_token),
            ("fido2_cred", &tools.fido2_cred),
            ("fido2_assert", &tools.fido2_assert),
            ("flatpak", &tools.flatpak),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.as_ref().map(|v| (key, v)))
        .collect()
    }

    /// Directory holding `*.bottle` files. `BOTTLE_DIR` wins over the config.
    pub fn bottle_dir(&self) -> PathBuf {
        self.bottle_dir_with(env::var_os(BOTTLE_DIR_ENV))
    }

    fn bottle_dir_with(&self, env_override: Option<OsString>) -> PathBuf {
        if let Some(dir) = env_override.filter(|value| !value.is_empty()) {
            return PathBuf::from(dir);
        }
        if let Some(dir) = non_empty(self.paths.bottle_dir.as_deref()) {
            return PathBuf::from(dir);
        }
        home_dir().join(".local").join("share").join("bottles")
    }

    /// Directory holding per-bottle metadata files.
    pub fn config_dir(&self) -> PathBuf {
        if let Some(dir) = non_empty(self.paths.config_dir.as_deref()) {
            return PathBuf::from(dir);
        }
        project_dirs()
            .map(|dirs| dirs.config_dir().to_path_buf())
            .unwrap_or_else(|| home_dir().join(".config").join(APP_NAME))
    }

    pub fn lock_delay(&self) -> Duration {
        Duration::from_millis(self.retry.lock_delay_ms)
    }

    pub fn child_grace(&self) -> Duration {
        Duration::from_millis(self.retry.child_grace_ms)
    }
}

fn home_dir() -> PathBuf {
    BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Locate an external tool: explicit config first, then `PATH`, then `defaults`.
///
/// A configured path that does not exist is an error rather than a silent
/// fallback, so a typo in the config never runs a different binary.
pub fn resolve_binary(
    configured: Option<&str>,
    defaults: &[&str],
    name: &str,
) -> BottleResult<PathBuf> {
    if let Some(path) = non_empty(configured) {
        let candidate = PathBuf::from(path);
        if candidate.exists() {
            return Ok(candidate);
        }
        return Err(BottleError::MissingTool(format!(
            "{name} configured at {} but missing",
            candidate.display()
        )));
    }

    if let Some(path) = find_in_path(name) {
        return Ok(path);
    }

    defaults
        .iter()
        .map(Path::new)
        .find(|path| path.exists())
        .map(Path::to_path_buf)
        .ok_or_else(|| {
            BottleError::MissingTool(format!("{name} not found in PATH or {:?}", defaults))
        })
}

pub fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            Some(candidate)
        } else {
            None
        }
    })
}
