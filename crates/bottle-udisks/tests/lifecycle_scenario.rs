use bottle_core::config::{Escalation, LaunchConfig, PathsCfg, ToolsCfg};
use bottle_core::error::{BottleError, BottleResult};
use bottle_core::secret::PasswordSecret;
use bottle_core::service::{BottleService, CreateRequest, NewCredential};
use bottle_provider::{DeviceLocator, MountPhase};
use bottle_udisks::UdisksHost;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};
use zeroize::Zeroizing;

const UDISKSCTL: &str = r#"#!/bin/sh
STATE="@STATE@"
echo "udisksctl $*" >> "$STATE/log"
cmd="$1"; shift
case "$cmd" in
  loop-setup)
    if [ -f "$STATE/malformed" ]; then
      echo "Mapped file $2."
      exit 0
    fi
    echo "/dev/loop7" > "$STATE/loop"
    echo "Mapped file $2 as /dev/loop7."
    ;;
  unlock)
    KEY="$4"
    if [ "$(cat "$KEY")" != "$(cat "$STATE/passphrase")" ]; then
      echo "Error unlocking /dev/loop7: GDBus.Error:org.freedesktop.UDisks2.Error.Failed: Error unlocking /dev/loop7: Failed to activate device: Operation not permitted" >&2
      exit 1
    fi
    touch "$STATE/crypt"
    echo "Unlocked /dev/loop7 as /dev/dm-5."
    ;;
  mount)
    if [ "$4" != "nodev,nosuid,noexec" ]; then
      echo "unexpected options $4" >&2
      exit 1
    fi
    if [ -f "$STATE/stale" ]; then
      rm -f "$STATE/stale"
      echo "Error looking up object for device $2" >&2
      exit 1
    fi
    TARGET="/media/tester/test"
    if [ -f "$STATE/target" ]; then
      TARGET="$(cat "$STATE/target")"
    fi
    if [ ! -f "$STATE/phantom" ]; then
      ESCAPED="$(printf '%s' "$TARGET" | sed 's/ /\\040/g')"
      printf '%s\n' "/dev/mapper/luks-5eed $ESCAPED ext4 rw,nosuid,nodev,noexec 0 0" > "$STATE/mounts"
    fi
    echo "Mounted $2 at $TARGET."
    ;;
  unmount)
    : > "$STATE/mounts"
    ;;
  lock)
    rm -f "$STATE/crypt"
    echo "Locked /dev/loop7."
    ;;
  loop-delete)
    rm -f "$STATE/loop"
    ;;
  *)
    echo "unsupported $cmd" >&2
    exit 1
    ;;
esac
"#;

const LOSETUP: &str = r#"#!/bin/sh
STATE="@STATE@"
echo "losetup $*" >> "$STATE/log"
case "$1" in
  -j)
    if [ -f "$STATE/loop" ]; then
      echo "$(cat "$STATE/loop"): []: ($2)"
    fi
    ;;
  --find)
    echo "/dev/loop999"
    ;;
  -d)
    ;;
  *)
    exit 1
    ;;
esac
"#;

const LSBLK: &str = r#"#!/bin/sh
STATE="@STATE@"
echo "$3 $3 loop"
if [ -f "$STATE/crypt" ]; then
  echo "/dev/mapper/luks-5eed /dev/dm-5 crypt"
fi
"#;

const CRYPTSETUP: &str = r#"#!/bin/sh
STATE="@STATE@"
echo "cryptsetup $*" >> "$STATE/log"
cmd="$1"; shift
KEYFILE=""
while [ $# -gt 0 ]; do
  case "$1" in
    --type) shift 2 ;;
    --batch-mode) shift ;;
    --key-file) KEYFILE="$2"; shift 2 ;;
    *) break ;;
  esac
done
case "$cmd" in
  luksFormat)
    cat "$KEYFILE" > "$STATE/passphrase"
    ;;
  open)
    if [ "$(cat "$KEYFILE")" != "$(cat "$STATE/passphrase")" ]; then
      echo "No key available with this passphrase." >&2
      exit 2
    fi
    ;;
  close)
    ;;
  *)
    exit 1
    ;;
esac
"#;

const MKFS: &str = r#"#!/bin/sh
echo "mkfs.ext4 $*" >> "@STATE@/log"
"#;

const SYNC: &str = r#"#!/bin/sh
echo "sync $*" >> "@STATE@/log"
"#;

struct Harness {
    _tmp: TempDir,
    state: PathBuf,
    bottle_dir: PathBuf,
    service: BottleService<UdisksHost>,
}

fn write_executable(path: &Path, contents: &str) -> BottleResult<()> {
    fs::write(path, contents)?;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)?;
    Ok(())
}

fn harness() -> BottleResult<Harness> {
    let tmp = tempdir()?;
    let bin = tmp.path().join("bin");
    let state = tmp.path().join("state");
    fs::create_dir_all(&bin)?;
    fs::create_dir_all(&state)?;
    fs::write(state.join("mounts"), "")?;

    let state_str = state.display().to_string();
    let tool = |name: &str, script: &str| -> BottleResult<Option<String>> {
        let path = bin.join(name);
        write_executable(&path, &script.replace("@STATE@", &state_str))?;
        Ok(Some(path.display().to_string()))
    };

    let tools = ToolsCfg {
        udisksctl: tool("udisksctl", UDISKSCTL)?,
        losetup: tool("losetup", LOSETUP)?,
        lsblk: tool("lsblk", LSBLK)?,
        cryptsetup: tool("cryptsetup", CRYPTSETUP)?,
        mkfs_ext4: tool("mkfs.ext4", MKFS)?,
        sync: tool("sync", SYNC)?,
        escalation: Escalation::None,
        ..ToolsCfg::default()
    };

    let bottle_dir = tmp.path().join("bottles");
    let config = LaunchConfig {
        paths: PathsCfg {
            bottle_dir: Some(bottle_dir.display().to_string()),
            config_dir: Some(tmp.path().join("conf").display().to_string()),
        },
        tools,
        ..LaunchConfig::default()
    };

    let host = UdisksHost::from_config(&config)?.with_mount_table(state.join("mounts"));
    let service = BottleService::new(Arc::new(config), Arc::new(host));
    Ok(Harness {
        _tmp: tmp,
        state,
        bottle_dir,
        service,
    })
}

fn create_test_bottle(h: &Harness) -> BottleResult<PathBuf> {
    let path = h.bottle_dir.join("test.bottle");
    h.service.create(CreateRequest {
        path: &path,
        size_bytes: 500 * 1024 * 1024,
        credential: NewCredential::Password(Zeroizing::new("correct".into())),
    })?;
    Ok(path)
}

fn log(h: &Harness) -> String {
    fs::read_to_string(h.state.join("log")).unwrap_or_default()
}

#[test]
fn create_mount_unmount_round_trip() -> BottleResult<()> {
    let h = harness()?;
    let path = create_test_bottle(&h)?;
    assert_eq!(fs::metadata(&path)?.len(), 500 * 1024 * 1024);

    let history = log(&h);
    let format = history
        .lines()
        .find(|line| line.starts_with("cryptsetup luksFormat"))
        .unwrap_or_default();
    assert!(format.starts_with("cryptsetup luksFormat --type luks2 --batch-mode --key-file "));
    assert!(history.contains("mkfs.ext4 -q -L test /dev/mapper/bottle-"));
    assert!(history.contains("losetup -d /dev/loop999"));

    let bottle = h.service.existing("test")?;
    let state = h.service.open(&bottle, &PasswordSecret::new("correct"))?;
    assert_eq!(state.phase(), MountPhase::Mounted);
    assert_eq!(state.mount_point(), Some(Path::new("/media/tester/test")));
    assert_eq!(state.cleartext_device(), Some("/dev/dm-5"));

    // Already mounted: a second open only probes.
    let before = log(&h).matches("udisksctl").count();
    let again = h.service.open(&bottle, &PasswordSecret::new("ignored"))?;
    assert_eq!(again, state);
    assert_eq!(log(&h).matches("udisksctl").count(), before);

    h.service.close(&bottle)?;
    let history = log(&h);
    assert!(history.contains("sync -f /media/tester/test"));
    assert!(history.contains("udisksctl lock -b /dev/loop7"));
    assert!(history.contains("udisksctl loop-delete -b /dev/loop7"));
    assert!(h.service.host().locate(bottle.file_path())?.is_empty());
    Ok(())
}

#[test]
fn wrong_password_is_classified_as_wrong_credential() -> BottleResult<()> {
    let h = harness()?;
    create_test_bottle(&h)?;
    let bottle = h.service.existing("test")?;

    let err = h
        .service
        .open(&bottle, &PasswordSecret::new("wrong"))
        .unwrap_err();
    assert!(err.is_wrong_credential(), "{err}");
    assert!(err.to_string().contains("Failed to activate device"));

    let state = h.service.host().locate(bottle.file_path())?;
    assert_eq!(state.phase(), MountPhase::Attached);
    h.service.close(&bottle)?;
    assert!(h.service.host().locate(bottle.file_path())?.is_empty());
    Ok(())
}

#[test]
fn stale_mapping_recovers_through_real_parsers() -> BottleResult<()> {
    let h = harness()?;
    create_test_bottle(&h)?;
    let bottle = h.service.existing("test")?;
    fs::write(h.state.join("stale"), "")?;

    let state = h.service.open(&bottle, &PasswordSecret::new("correct"))?;
    assert_eq!(state.phase(), MountPhase::Mounted);

    let history = log(&h);
    assert_eq!(history.matches("udisksctl mount").count(), 2);
    assert_eq!(history.matches("udisksctl unlock").count(), 2);
    assert_eq!(history.matches("udisksctl lock").count(), 1);
    Ok(())
}

#[test]
fn mount_point_with_spaces_is_kept_whole() -> BottleResult<()> {
    let h = harness()?;
    create_test_bottle(&h)?;
    let bottle = h.service.existing("test")?;
    fs::write(h.state.join("target"), "/media/tester/my test")?;

    let state = h.service.open(&bottle, &PasswordSecret::new("correct"))?;
    assert_eq!(state.mount_point(), Some(Path::new("/media/tester/my test")));
    let located = h.service.host().locate(bottle.file_path())?;
    assert_eq!(located.mount_point(), Some(Path::new("/media/tester/my test")));

    h.service.close(&bottle)?;
    assert!(log(&h).contains("sync -f /media/tester/my test"));
    Ok(())
}

#[test]
fn mount_point_missing_from_mount_table_is_fatal() -> BottleResult<()> {
    let h = harness()?;
    create_test_bottle(&h)?;
    let bottle = h.service.existing("test")?;
    fs::write(h.state.join("phantom"), "")?;

    match h.service.open(&bottle, &PasswordSecret::new("correct")) {
        Err(BottleError::MalformedOutput { operation, .. }) => {
            assert_eq!(operation, "mount /dev/dm-5")
        }
        other => panic!("unexpected result: {other:?}"),
    }
    Ok(())
}

#[test]
fn unparseable_attach_output_is_fatal() -> BottleResult<()> {
    let h = harness()?;
    create_test_bottle(&h)?;
    let bottle = h.service.existing("test")?;
    fs::write(h.state.join("malformed"), "")?;

    match h.service.open(&bottle, &PasswordSecret::new("correct")) {
        Err(BottleError::MalformedOutput { expected, .. }) => assert_eq!(expected, "loop device"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(!log(&h).contains("udisksctl unlock"));
    Ok(())
}

#[test]
fn deleting_an_attached_bottle_is_refused() -> BottleResult<()> {
    let h = harness()?;
    let path = create_test_bottle(&h)?;
    let bottle = h.service.existing("test")?;
    h.service.open(&bottle, &PasswordSecret::new("correct"))?;

    let err = h.service.delete(&bottle).unwrap_err();
    assert!(matches!(err, BottleError::Busy(_)));
    assert!(path.exists());

    h.service.close(&bottle)?;
    h.service.delete(&bottle)?;
    assert!(!path.exists());
    Ok(())
}

#[test]
fn missing_configured_tool_fails_before_anything_runs() {
    let config = LaunchConfig {
        tools: ToolsCfg {
            udisksctl: Some("/nonexistent/udisksctl".into()),
            ..ToolsCfg::default()
        },
        ..LaunchConfig::default()
    };
    match UdisksHost::from_config(&config) {
        Err(BottleError::MissingTool(_)) => {}
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
}
