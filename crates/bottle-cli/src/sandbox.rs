//! Flatpak glue: argument table, home layout and app listing.

use bottle_core::config::{resolve_binary, LaunchConfig};
use bottle_core::error::BottleResult;
use bottle_core::{Permission, PermissionSet};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

const DEFAULT_FLATPAK_PATHS: &[&str] = &["/usr/bin/flatpak", "/bin/flatpak"];

/// Directories created inside the bottle before every launch.
pub const HOME_DIRS: [&str; 4] = ["Downloads", ".config", ".local/share", ".cache"];

const PORTAL_NAMES: [&str; 3] = [
    "org.freedesktop.portal.Desktop",
    "org.freedesktop.portal.Notification",
    "org.freedesktop.portal.FileChooser",
];

fn capability_args(perm: Permission) -> Vec<String> {
    match perm {
        Permission::Network => vec!["--share=network".into()],
        Permission::Audio => vec!["--socket=pulseaudio".into()],
        Permission::Gpu => vec!["--device=dri".into()],
        Permission::Wayland => vec!["--socket=wayland".into()],
        Permission::X11 => vec!["--socket=fallback-x11".into()],
        Permission::Camera => vec!["--device=video0".into()],
        Permission::Portals => PORTAL_NAMES
            .iter()
            .map(|name| format!("--talk-name={name}"))
            .collect(),
    }
}

fn env_arg(name: &str, value: &Path) -> OsString {
    let mut arg = OsString::from(format!("--env={name}="));
    arg.push(value);
    arg
}

/// `flatpak run` arguments for `app_id` with the bottle as its home.
pub fn flatpak_args(
    app_id: &str,
    mount_point: &Path,
    permissions: &PermissionSet,
    extra: &[String],
) -> Vec<OsString> {
    let mut filesystem = OsString::from("--filesystem=");
    filesystem.push(mount_point);

    let mut args: Vec<OsString> = vec!["run".into(), "--sandbox".into(), filesystem];
    for perm in Permission::ALL {
        if permissions.get(perm) {
            args.extend(capability_args(perm).into_iter().map(OsString::from));
        }
    }

    args.push("--env=GTK_USE_PORTAL=0".into());
    args.push(env_arg("HOME", mount_point));
    args.push(env_arg("XDG_DATA_HOME", &mount_point.join(".local/share")));
    args.push(env_arg("XDG_CONFIG_HOME", &mount_point.join(".config")));
    args.push(env_arg("XDG_CACHE_HOME", &mount_point.join(".cache")));
    args.push(env_arg("XDG_DOWNLOAD_DIR", &mount_point.join("Downloads")));

    args.push(app_id.into());
    args.extend(extra.iter().map(OsString::from));
    args
}

pub fn prepare_home(mount_point: &Path) -> BottleResult<()> {
    for dir in HOME_DIRS {
        fs::create_dir_all(mount_point.join(dir))?;
    }
    Ok(())
}

/// Installed application, as listed by `flatpak list --app`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatpakApp {
    pub id: String,
    pub name: String,
}

/// Parse `application<TAB>name` rows, sorted by display name.
pub fn parse_app_list(stdout: &str) -> Vec<FlatpakApp> {
    let mut apps: Vec<FlatpakApp> = stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let (id, name) = line.split_once('\t').unwrap_or((line, line));
            FlatpakApp {
                id: id.trim().to_string(),
                name: name.trim().to_string(),
            }
        })
        .collect();
    apps.sort_by(|a, b| a.name.cmp(&b.name));
    apps
}

#[derive(Debug, Clone)]
pub struct Flatpak {
    binary: PathBuf,
}

impl Flatpak {
    pub fn from_config(config: &LaunchConfig) -> BottleResult<Self> {
        let binary = resolve_binary(config.tools.flatpak.as_deref(), DEFAULT_FLATPAK_PATHS, "flatpak")?;
        Ok(Self { binary })
    }

    pub fn list_apps(&self) -> BottleResult<Vec<FlatpakApp>> {
        let output = Command::new(&self.binary)
            .args(["list", "--app", "--columns=application,name"])
            .stdin(Stdio::null())
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(bottle_core::BottleError::tool("flatpak list", stderr.trim()));
        }
        Ok(parse_app_list(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Start the app attached to this terminal.
    pub fn spawn(&self, args: &[OsString]) -> BottleResult<Child> {
        log::debug!("exec {} {:?}", self.binary.display(), args);
        Ok(Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?)
    }
}
