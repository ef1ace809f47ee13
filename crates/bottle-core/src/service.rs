//! Bottle-level operations: status, create, open, close, delete.

use crate::bottle::{list_bottles, normalize_bottle_path, BottleContainer};
use crate::config::LaunchConfig;
use crate::error::{BottleError, BottleResult};
use crate::provider::{BottleHost, DeviceLocator, ProvisionRequest, VolumeProvisioner};
use crate::secret::{Enrollment, SecretProvider};
use crate::store::{self, BottleMetadata, Credential};
use crate::workflow::{
    event, LockRetry, MountOrchestrator, UnmountOrchestrator, WorkflowEvent, WorkflowLevel,
    WorkflowReport,
};
use bottle_provider::MountState;
use log::{info, warn};
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Key source for a bottle that does not exist yet.
pub enum NewCredential {
    /// Empty means the format tool prompts on its own.
    Password(Zeroizing<String>),
    /// Credential already created on the authenticator, with its first key.
    HardwareKey(Enrollment),
}

pub struct CreateRequest<'a> {
    pub path: &'a Path,
    pub size_bytes: u64,
    pub credential: NewCredential,
}

/// One row of a status listing.
#[derive(Debug, Clone)]
pub struct BottleStatus {
    pub container: BottleContainer,
    pub state: MountState,
    /// `Err` carries the reason metadata could not be read.
    pub metadata: Result<BottleMetadata, String>,
}

/// High-level façade over a host implementation.
pub struct BottleService<H> {
    config: Arc<LaunchConfig>,
    host: Arc<H>,
}

impl<H> BottleService<H>
where
    H: BottleHost,
{
    pub fn new(config: Arc<LaunchConfig>, host: Arc<H>) -> Self {
        Self { config, host }
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    /// Resolve a name or path to a bottle identity.
    pub fn resolve(&self, name_or_path: &str) -> BottleResult<BottleContainer> {
        let path = normalize_bottle_path(name_or_path, &self.config.bottle_dir());
        BottleContainer::new(&path, &self.config.config_dir())
    }

    /// Resolve and require the backing file to exist.
    pub fn existing(&self, name_or_path: &str) -> BottleResult<BottleContainer> {
        let bottle = self.resolve(name_or_path)?;
        if !bottle.file_path().is_file() {
            return Err(BottleError::InvalidConfig(format!(
                "no bottle at {}",
                bottle.file_path().display()
            )));
        }
        Ok(bottle)
    }

    pub fn metadata(&self, bottle: &BottleContainer) -> BottleResult<BottleMetadata> {
        store::load(bottle.config_path())
    }

    pub fn save_metadata(
        &self,
        bottle: &BottleContainer,
        metadata: &BottleMetadata,
    ) -> BottleResult<()> {
        store::save(bottle.config_path(), metadata)
    }

    pub fn status(&self, bottle: &BottleContainer) -> BottleResult<BottleStatus> {
        let state = self.host.locate(bottle.file_path())?;
        let metadata = self.metadata(bottle).map_err(|err| err.to_string());
        Ok(BottleStatus {
            container: bottle.clone(),
            state,
            metadata,
        })
    }

    /// Status of every bottle in the configured directory.
    pub fn list(&self) -> BottleResult<Vec<BottleStatus>> {
        let config_dir = self.config.config_dir();
        list_bottles(&self.config.bottle_dir())?
            .iter()
            .map(|path| {
                let bottle = BottleContainer::new(path, &config_dir)?;
                self.status(&bottle)
            })
            .collect()
    }

    /// Mount `bottle`, resuming from whatever state the host reports.
    pub fn open(
        &self,
        bottle: &BottleContainer,
        secret: &dyn SecretProvider,
    ) -> BottleResult<MountState> {
        MountOrchestrator::new(&*self.host, &*self.host).mount(bottle.file_path(), secret)
    }

    /// Fully release `bottle` based on a fresh probe.
    pub fn close(&self, bottle: &BottleContainer) -> BottleResult<()> {
        let state = self.host.locate(bottle.file_path())?;
        UnmountOrchestrator::new(&*self.host, LockRetry::from_config(&self.config))
            .unmount(&state)
    }

    /// Identity for a bottle about to be created. Creates the parent
    /// directory and refuses to reuse an existing file.
    pub fn prepare(&self, path: &Path) -> BottleResult<BottleContainer> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let bottle = BottleContainer::new(path, &self.config.config_dir())?;
        if bottle.file_path().exists() {
            return Err(BottleError::Busy(format!(
                "{} already exists; refusing to overwrite",
                bottle.file_path().display()
            )));
        }
        Ok(bottle)
    }

    /// Create, format and populate a new bottle.
    ///
    /// The backing file is claimed first with an exclusive create. Hardware-key
    /// metadata is then written before the destructive format so a crash
    /// afterwards still leaves the credential binding on disk. On failure
    /// after the claim, both the file and metadata are removed; a file this
    /// call did not create is never touched.
    pub fn create(&self, request: CreateRequest<'_>) -> BottleResult<WorkflowReport> {
        let bottle = self.prepare(request.path)?;
        let file = bottle.file_path();
        if request.size_bytes == 0 {
            return Err(BottleError::InvalidConfig("bottle size must be positive".into()));
        }

        let mut events = Vec::new();
        let (key, metadata) = match request.credential {
            NewCredential::Password(password) => (
                Zeroizing::new(password.as_bytes().to_vec()),
                BottleMetadata::default(),
            ),
            NewCredential::HardwareKey(Enrollment { binding, key }) => (
                key,
                BottleMetadata {
                    credential: Credential::HardwareKey(binding),
                    ..BottleMetadata::default()
                },
            ),
        };
        let hardware = matches!(metadata.credential, Credential::HardwareKey(_));

        allocate(file, request.size_bytes)?;

        let label = bottle.fs_label();
        let result = self.format_claimed(&bottle, &metadata, &label, &key, &mut events);

        if let Err(err) = result {
            warn!("creation of {} failed; cleaning up", file.display());
            if let Err(cleanup) = fs::remove_file(file) {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!("could not remove {}: {cleanup}", file.display());
                }
            }
            if hardware {
                if let Err(cleanup) = store::remove(bottle.config_path()) {
                    warn!("could not remove {}: {cleanup}", bottle.config_path().display());
                }
            }
            return Err(err);
        }

        events.push(event(
            WorkflowLevel::Success,
            format!(
                "Formatted {} ({} bytes, LUKS2, ext4 label `{label}`)",
                file.display(),
                request.size_bytes
            ),
        ));

        if !hardware {
            self.save_metadata(&bottle, &metadata)?;
        }
        info!("created bottle {}", bottle.name());

        Ok(WorkflowReport {
            title: format!("Created bottle {}", bottle.name()),
            events,
        })
    }

    /// Everything after the file claim: binding first, then the format.
    fn format_claimed(
        &self,
        bottle: &BottleContainer,
        metadata: &BottleMetadata,
        label: &str,
        key: &[u8],
        events: &mut Vec<WorkflowEvent>,
    ) -> BottleResult<()> {
        if matches!(metadata.credential, Credential::HardwareKey(_)) {
            self.save_metadata(bottle, metadata)?;
            events.push(event(
                WorkflowLevel::Security,
                format!(
                    "Recorded hardware-key binding at {}",
                    bottle.config_path().display()
                ),
            ));
        }
        self.host.provision(&ProvisionRequest {
            file: bottle.file_path(),
            mapper_name: bottle.mapper_name(),
            label,
            key,
        })
    }

    /// Remove an idle bottle and its metadata. Refuses while attached.
    pub fn delete(&self, bottle: &BottleContainer) -> BottleResult<WorkflowReport> {
        let state = self.host.locate(bottle.file_path())?;
        if !state.is_empty() {
            return Err(BottleError::Busy(format!(
                "{} is in use ({}); close it before deleting",
                bottle.name(),
                state.phase()
            )));
        }

        let mut events = Vec::new();
        fs::remove_file(bottle.file_path())?;
        events.push(event(
            WorkflowLevel::Success,
            format!("Removed {}", bottle.file_path().display()),
        ));
        if bottle.config_path().exists() {
            store::remove(bottle.config_path())?;
            events.push(event(
                WorkflowLevel::Info,
                format!("Removed metadata {}", bottle.config_path().display()),
            ));
        } else {
            events.push(event(
                WorkflowLevel::Warn,
                format!("No metadata at {}", bottle.config_path().display()),
            ));
        }

        Ok(WorkflowReport {
            title: format!("Deleted bottle {}", bottle.name()),
            events,
        })
    }
}

/// Exclusively create `file` as a sparse file of `size` bytes.
///
/// Losing the race to another creator fails without touching its file.
fn allocate(file: &Path, size: u64) -> BottleResult<()> {
    let handle = OpenOptions::new().write(true).create_new(true).open(file)?;
    if let Err(err) = handle.set_len(size).and_then(|()| handle.sync_all()) {
        drop(handle);
        if let Err(cleanup) = fs::remove_file(file) {
            warn!("could not remove {}: {cleanup}", file.display());
        }
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathsCfg;
    use crate::provider::{VolumeManager, VolumeProvisioner};
    use crate::secret::PasswordSecret;
    use crate::store::HardwareKeyBinding;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    /// Host that tracks attachment per file and records provisioning.
    #[derive(Default)]
    struct MemoryHost {
        attached: Mutex<Option<MountState>>,
        provisioned: Mutex<Vec<(PathBuf, String, String, Vec<u8>)>>,
        fail_provision: bool,
        config_seen_at_format: Mutex<Option<bool>>,
        watch_config: Option<PathBuf>,
    }

    impl DeviceLocator for MemoryHost {
        type Error = BottleError;

        fn locate(&self, _file: &Path) -> BottleResult<MountState> {
            Ok(self
                .attached
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(MountState::unattached))
        }
    }

    impl VolumeManager for MemoryHost {
        type Error = BottleError;

        fn attach(&self, _file: &Path) -> BottleResult<String> {
            Ok("/dev/loop0".into())
        }

        fn unlock(&self, _loop_device: &str, _key: &[u8]) -> BottleResult<String> {
            Ok("/dev/dm-0".into())
        }

        fn mount(&self, _cleartext_device: &str) -> BottleResult<PathBuf> {
            let state = MountState::mounted("/dev/loop0", "/dev/dm-0", "/media/u/x");
            *self.attached.lock().unwrap() = Some(state);
            Ok(PathBuf::from("/media/u/x"))
        }

        fn flush(&self, _mount_point: &Path) -> BottleResult<()> {
            Ok(())
        }

        fn unmount(&self, _cleartext_device: &str, _force: bool) -> BottleResult<()> {
            Ok(())
        }

        fn lock(&self, _loop_device: &str) -> BottleResult<()> {
            Ok(())
        }

        fn detach(&self, _loop_device: &str) -> BottleResult<()> {
            *self.attached.lock().unwrap() = None;
            Ok(())
        }
    }

    impl VolumeProvisioner for MemoryHost {
        type Error = BottleError;

        fn provision(&self, request: &ProvisionRequest<'_>) -> BottleResult<()> {
            if let Some(path) = &self.watch_config {
                *self.config_seen_at_format.lock().unwrap() = Some(path.exists());
            }
            if self.fail_provision {
                return Err(BottleError::tool(
                    "luksFormat",
                    "Cannot format device /dev/loop0 in use",
                ));
            }
            self.provisioned.lock().unwrap().push((
                request.file.to_path_buf(),
                request.mapper_name.to_string(),
                request.label.to_string(),
                request.key.to_vec(),
            ));
            Ok(())
        }
    }

    fn service(dir: &TempDir, host: MemoryHost) -> BottleService<MemoryHost> {
        let config = LaunchConfig {
            paths: PathsCfg {
                bottle_dir: Some(dir.path().join("bottles").display().to_string()),
                config_dir: Some(dir.path().join("conf").display().to_string()),
            },
            ..LaunchConfig::default()
        };
        BottleService::new(Arc::new(config), Arc::new(host))
    }

    fn binding() -> HardwareKeyBinding {
        HardwareKeyBinding {
            bottle_id: "YmlkYmlkYmlk".into(),
            credential_id: "Y2lk".into(),
            salt: "c2FsdA==".into(),
            device_hint: Some("/dev/hidraw2".into()),
        }
    }

    #[test]
    fn create_password_bottle_allocates_and_formats() {
        let dir = tempdir().unwrap();
        let svc = service(&dir, MemoryHost::default());
        let path = dir.path().join("bottles").join("test.bottle");

        let report = svc
            .create(CreateRequest {
                path: &path,
                size_bytes: 500 * 1024 * 1024,
                credential: NewCredential::Password(Zeroizing::new("correct".into())),
            })
            .unwrap();

        assert_eq!(report.title, "Created bottle test");
        assert_eq!(fs::metadata(&path).unwrap().len(), 500 * 1024 * 1024);
        let provisioned = svc.host().provisioned.lock().unwrap().clone();
        assert_eq!(provisioned.len(), 1);
        let (file, mapper, label, key) = &provisioned[0];
        assert_eq!(file, &fs::canonicalize(&path).unwrap());
        assert!(mapper.starts_with("bottle-"));
        assert_eq!(label, "test");
        assert_eq!(key, b"correct");

        let bottle = svc.resolve(path.to_str().unwrap()).unwrap();
        assert_eq!(svc.metadata(&bottle).unwrap().credential, Credential::Password);
    }

    #[test]
    fn hardware_key_metadata_exists_before_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bottles").join("hw.bottle");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let conf_dir = dir.path().join("conf");
        let expected_conf = BottleContainer::new(&path, &conf_dir)
            .unwrap()
            .config_path()
            .to_path_buf();
        let host = MemoryHost {
            watch_config: Some(expected_conf.clone()),
            ..MemoryHost::default()
        };
        let svc = service(&dir, host);

        svc.create(CreateRequest {
            path: &path,
            size_bytes: 1 << 20,
            credential: NewCredential::HardwareKey(Enrollment {
                binding: binding(),
                key: Zeroizing::new(vec![0x5a; 32]),
            }),
        })
        .unwrap();

        assert_eq!(*svc.host().config_seen_at_format.lock().unwrap(), Some(true));
        let loaded = store::load(&expected_conf).unwrap();
        assert_eq!(loaded.credential, Credential::HardwareKey(binding()));
    }

    #[test]
    fn failed_format_removes_file_and_metadata() {
        let dir = tempdir().unwrap();
        let svc = service(
            &dir,
            MemoryHost {
                fail_provision: true,
                ..MemoryHost::default()
            },
        );
        let path = dir.path().join("bottles").join("broken.bottle");

        let err = svc
            .create(CreateRequest {
                path: &path,
                size_bytes: 1 << 20,
                credential: NewCredential::HardwareKey(Enrollment {
                    binding: binding(),
                    key: Zeroizing::new(vec![1; 32]),
                }),
            })
            .unwrap_err();

        assert_eq!(err.to_string(), "luksFormat: Cannot format device /dev/loop0 in use");
        assert!(!path.exists());
        let bottle = svc.resolve(path.to_str().unwrap()).unwrap();
        assert!(!bottle.config_path().exists());
    }

    #[test]
    fn losing_the_create_race_leaves_the_other_file_alone() {
        let dir = tempdir().unwrap();
        let svc = service(&dir, MemoryHost::default());
        let bottles = dir.path().join("bottles");
        fs::create_dir_all(&bottles).unwrap();
        let path = bottles.join("raced.bottle");
        // Invisible to the existence check, but occupies the name.
        std::os::unix::fs::symlink(dir.path().join("elsewhere"), &path).unwrap();

        let err = svc
            .create(CreateRequest {
                path: &path,
                size_bytes: 1 << 20,
                credential: NewCredential::HardwareKey(Enrollment {
                    binding: binding(),
                    key: Zeroizing::new(vec![1; 32]),
                }),
            })
            .unwrap_err();

        match err {
            BottleError::Io(io) => assert_eq!(io.kind(), std::io::ErrorKind::AlreadyExists),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(fs::symlink_metadata(&path).unwrap().file_type().is_symlink());
        let bottle = svc.resolve(path.to_str().unwrap()).unwrap();
        assert!(!bottle.config_path().exists());
        assert!(svc.host().provisioned.lock().unwrap().is_empty());
    }

    #[test]
    fn allocate_creates_sparse_file_once() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("x.bottle");
        allocate(&file, 4096).unwrap();
        assert_eq!(fs::metadata(&file).unwrap().len(), 4096);

        fs::write(&file, b"theirs").unwrap();
        assert!(allocate(&file, 4096).is_err());
        assert_eq!(fs::read(&file).unwrap(), b"theirs");
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let svc = service(&dir, MemoryHost::default());
        let path = dir.path().join("exists.bottle");
        fs::write(&path, b"keep me").unwrap();

        let err = svc
            .create(CreateRequest {
                path: &path,
                size_bytes: 1 << 20,
                credential: NewCredential::Password(Zeroizing::new(String::new())),
            })
            .unwrap_err();
        assert!(matches!(err, BottleError::Busy(_)));
        assert_eq!(fs::read(&path).unwrap(), b"keep me");
    }

    #[test]
    fn delete_refuses_attached_bottle() {
        let dir = tempdir().unwrap();
        let svc = service(&dir, MemoryHost::default());
        let path = dir.path().join("busy.bottle");
        fs::write(&path, b"").unwrap();
        let bottle = svc.existing(path.to_str().unwrap()).unwrap();

        svc.open(&bottle, &PasswordSecret::new("any")).unwrap();
        let err = svc.delete(&bottle).unwrap_err();
        assert!(matches!(err, BottleError::Busy(_)));
        assert!(path.exists());

        svc.close(&bottle).unwrap();
        svc.delete(&bottle).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn delete_warns_when_metadata_is_already_gone() {
        let dir = tempdir().unwrap();
        let svc = service(&dir, MemoryHost::default());
        let path = dir.path().join("orphan.bottle");
        fs::write(&path, b"").unwrap();
        let bottle = svc.existing(path.to_str().unwrap()).unwrap();

        let report = svc.delete(&bottle).unwrap();
        assert!(!path.exists());
        let last = report.events.last().unwrap();
        assert_eq!(last.level, WorkflowLevel::Warn);
        assert!(last.message.starts_with("No metadata at "));
    }

    #[test]
    fn list_reports_each_bottle_with_metadata_errors_inline() {
        let dir = tempdir().unwrap();
        let svc = service(&dir, MemoryHost::default());
        let bottles = dir.path().join("bottles");
        fs::create_dir_all(&bottles).unwrap();
        fs::write(bottles.join("a.bottle"), b"").unwrap();
        fs::write(bottles.join("b.bottle"), b"").unwrap();

        let broken = svc.resolve("b").unwrap();
        fs::create_dir_all(broken.config_path().parent().unwrap()).unwrap();
        fs::write(broken.config_path(), "FIDO2_SALT=\"x\"\n").unwrap();

        let rows = svc.list().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].metadata.is_ok());
        assert!(rows[1].metadata.as_ref().unwrap_err().contains("partial"));
    }
}
