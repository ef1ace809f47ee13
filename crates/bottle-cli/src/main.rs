//! bottle-launch: create, open and run applications inside encrypted bottles.

use anyhow::{bail, ensure, Context, Result};
use bottle_core::bottle::{normalize_bottle_path, parse_size};
use bottle_core::config::LaunchConfig;
use bottle_core::secret::enroll_hardware_key;
use bottle_core::store;
use bottle_core::workflow::{ensure_privilege_support, LockRetry, WorkflowLevel, WorkflowReport};
use bottle_core::{
    logging, BottleContainer, BottleService, BottleStatus, CreateRequest, Credential,
    LifecycleCoordinator, NewCredential, Permission, PermissionSet,
};
use bottle_fido2::Fido2Tools;
use bottle_udisks::UdisksHost;
use clap::{Parser, Subcommand};
use log::warn;
use rpassword::prompt_password;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use zeroize::Zeroizing;

mod sandbox;
mod session;
mod signals;

use sandbox::Flatpak;
use session::{SecretSource, Session};

/// Unlock attempts before giving up on a wrong password or missing key.
const UNLOCK_ATTEMPTS: u32 = 3;

fn load_cli_config(path: Option<PathBuf>) -> Result<LaunchConfig> {
    let path = path
        .or_else(LaunchConfig::default_path)
        .context("cannot determine the configuration path; pass --config")?;
    LaunchConfig::load_or_default(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "bottle-launch",
    version,
    about = "Run Flatpak applications with their home inside an encrypted LUKS2 bottle."
)]
struct Cli {
    /// Configuration file (default: $BOTTLE_LAUNCH_CONFIG or the per-user config).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create and format a new bottle.
    Create {
        /// Bottle name or path; `.bottle` is appended when missing.
        name: String,

        /// Size such as 500M, 2G or 1.5G.
        #[arg(long, default_value = "2G")]
        size: String,

        /// Derive the key from a FIDO2 security key instead of a password.
        #[arg(long)]
        hardware_key: bool,

        /// Authenticator device node (e.g. /dev/hidraw3) when several are attached.
        #[arg(long)]
        device: Option<String>,

        /// Ask for the password here instead of letting cryptsetup prompt.
        #[arg(long)]
        prompt_password: bool,
    },

    /// Mount a bottle, run an app inside it, then unmount and lock.
    Run {
        name: String,

        /// Flatpak application id; defaults to the last app run in this bottle.
        app: Option<String>,

        /// Arguments passed to the application after `--`.
        #[arg(last = true)]
        args: Vec<String>,

        /// Ask for the password here instead of the udisks agent.
        #[arg(long)]
        prompt_password: bool,

        /// Authenticator device node for hardware-key bottles.
        #[arg(long)]
        device: Option<String>,
    },

    /// Show every bottle with its mount state.
    List,

    /// Show identity, mount state and metadata of one bottle.
    Status { name: String },

    /// Remove an idle bottle and its metadata.
    Delete {
        name: String,

        /// Confirm the deletion.
        #[arg(long)]
        yes: bool,
    },

    /// Show or change sandbox permissions of a bottle.
    Permissions {
        name: String,

        #[arg(long, value_name = "PERMISSION")]
        enable: Vec<String>,

        #[arg(long, value_name = "PERMISSION")]
        disable: Vec<String>,

        #[arg(long, value_name = "PERMISSION")]
        toggle: Vec<String>,
    },

    /// List installed Flatpak applications.
    Apps,

    /// Inspect the launcher configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Report configuration problems.
    Validate,
    /// Print the JSON schema of the configuration file.
    Schema,
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    }
}

/// Dispatch to the requested subcommand. Returns the process exit code.
async fn run() -> Result<i32> {
    logging::init("info");
    let cli = Cli::parse();
    let config = load_cli_config(cli.config)?;

    match cli.command {
        Commands::Create {
            name,
            size,
            hardware_key,
            device,
            prompt_password,
        } => {
            ensure!(
                !(hardware_key && prompt_password),
                "--prompt-password cannot be combined with --hardware-key"
            );
            let size_bytes = parse_size(&size)?;
            ensure_privilege_support(config.tools.escalation)?;
            let service = build_service(config)?;
            service
                .host()
                .provisioner()
                .context("formatting tools unavailable")?;

            let path = normalize_bottle_path(&name, &service.config().bottle_dir());
            let bottle = service.prepare(&path)?;

            let credential = if hardware_key {
                let tools = Fido2Tools::from_config(service.config())
                    .context("hardware-key bottles need libfido2's command-line tools")?;
                let fido2 = &service.config().fido2;
                eprintln!("Touch the security key when it blinks (twice).");
                let enrollment =
                    enroll_hardware_key(&tools, &fido2.rp_id, &fido2.user_name, device.as_deref())?;
                NewCredential::HardwareKey(enrollment)
            } else if prompt_password {
                NewCredential::Password(prompt_new_password()?)
            } else {
                NewCredential::Password(Zeroizing::new(String::new()))
            };

            let report = service.create(CreateRequest {
                path: bottle.file_path(),
                size_bytes,
                credential,
            })?;
            print_report(report);
            Ok(0)
        }

        Commands::Run {
            name,
            app,
            args,
            prompt_password,
            device,
        } => {
            let service = build_service(config)?;
            run_bottle(service, &name, app, &args, prompt_password, device).await
        }

        Commands::List => {
            let service = build_service(config)?;
            let statuses = service.list()?;
            if statuses.is_empty() {
                println!("No bottles in {}", service.config().bottle_dir().display());
                return Ok(0);
            }
            println!("{:<24} {:<24} {:<13} MOUNT", "BOTTLE", "STATE", "CREDENTIAL");
            for status in statuses {
                let credential = match &status.metadata {
                    Ok(metadata) => metadata.credential.kind().label(),
                    Err(_) => "corrupted",
                };
                println!(
                    "{:<24} {:<24} {:<13} {}",
                    status.container.name(),
                    status.state.phase().to_string(),
                    credential,
                    status
                        .state
                        .mount_point()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "-".into())
                );
            }
            Ok(0)
        }

        Commands::Status { name } => {
            let service = build_service(config)?;
            let bottle = service.existing(&name)?;
            print_status(&service.status(&bottle)?);
            Ok(0)
        }

        Commands::Delete { name, yes } => {
            let service = build_service(config)?;
            let bottle = service.existing(&name)?;
            ensure!(
                yes,
                "refusing to delete {} without --yes; its contents are unrecoverable",
                bottle.file_path().display()
            );
            print_report(service.delete(&bottle)?);
            Ok(0)
        }

        Commands::Permissions {
            name,
            enable,
            disable,
            toggle,
        } => {
            let path = normalize_bottle_path(&name, &config.bottle_dir());
            let bottle = BottleContainer::new(&path, &config.config_dir())?;
            ensure!(
                bottle.file_path().is_file(),
                "no bottle at {}",
                bottle.file_path().display()
            );

            let mut metadata = store::load(bottle.config_path())?;
            let mut changed = false;
            for name in &enable {
                metadata.permissions.set(parse_permission(name)?, true);
                changed = true;
            }
            for name in &disable {
                metadata.permissions.set(parse_permission(name)?, false);
                changed = true;
            }
            for name in &toggle {
                metadata.permissions.toggle(parse_permission(name)?);
                changed = true;
            }
            if changed {
                store::save(bottle.config_path(), &metadata)?;
            }
            print_permissions(&bottle, &metadata.permissions);
            Ok(0)
        }

        Commands::Apps => {
            let flatpak = Flatpak::from_config(&config)?;
            for app in flatpak.list_apps()? {
                println!("{:<40} {}", app.id, app.name);
            }
            Ok(0)
        }

        Commands::Config { command } => match command {
            ConfigCommand::Validate => {
                let issues = config.validate();
                if issues.is_empty() {
                    println!("Configuration OK ({})", config.path.display());
                    return Ok(0);
                }
                for issue in &issues {
                    println!("  [WARN] {issue}");
                }
                bail!("{} configuration issue(s) found", issues.len());
            }
            ConfigCommand::Schema => {
                let schema = schema_for!(LaunchConfig);
                println!("{}", to_string_pretty(&schema)?);
                Ok(0)
            }
        },
    }
}

fn build_service(config: LaunchConfig) -> Result<Arc<BottleService<UdisksHost>>> {
    let host = UdisksHost::from_config(&config).context("volume tools unavailable")?;
    Ok(Arc::new(BottleService::new(Arc::new(config), Arc::new(host))))
}

/// Mount, run the app, always release. Returns the app's exit code.
async fn run_bottle(
    service: Arc<BottleService<UdisksHost>>,
    name: &str,
    app: Option<String>,
    args: &[String],
    prompt: bool,
    device: Option<String>,
) -> Result<i32> {
    let bottle = service.existing(name)?;
    let mut metadata = service
        .metadata(&bottle)
        .with_context(|| format!("cannot determine how {} is unlocked", bottle.name()))?;
    let app = app
        .or_else(|| Some(metadata.permissions.last_app.clone()).filter(|app| !app.is_empty()))
        .context("no application given and none recorded for this bottle")?;
    let flatpak = Flatpak::from_config(service.config())?;

    let config = service.config();
    let coordinator = Arc::new(LifecycleCoordinator::new(
        Arc::clone(service.host()),
        LockRetry::from_config(config),
        config.child_grace(),
    ));
    let watcher =
        signals::spawn_watcher(Arc::clone(&coordinator)).context("install signal handlers")?;
    let mut session = Session::new(Arc::clone(&service), Arc::clone(&coordinator));

    let mounted = match &metadata.credential {
        Credential::Password => {
            session
                .mount_with_retries(&bottle, UNLOCK_ATTEMPTS, |attempt| {
                    let password = if prompt {
                        prompt_password(format!(
                            "Password for {} ({attempt}/{UNLOCK_ATTEMPTS}): ",
                            bottle.name()
                        ))?
                    } else {
                        String::new()
                    };
                    Ok(SecretSource::Password(Zeroizing::new(password)))
                })
                .await
        }
        Credential::HardwareKey(binding) => {
            let tools = Fido2Tools::from_config(config)
                .context("hardware-key bottles need libfido2's command-line tools")?;
            session
                .mount_with_retries(&bottle, UNLOCK_ATTEMPTS, |attempt| {
                    if attempt > 1 {
                        eprintln!("Insert the security key and press Enter.");
                        io::stdin().lock().read_line(&mut String::new())?;
                    }
                    eprintln!("Touch the security key to unlock {}.", bottle.name());
                    Ok(SecretSource::HardwareKey {
                        tools: tools.clone(),
                        binding: binding.clone(),
                        rp_id: config.fido2.rp_id.clone(),
                        device: device.clone(),
                    })
                })
                .await
        }
    };
    let state = mounted.with_context(|| format!("failed to open {}", bottle.name()))?;
    let mount_point = state
        .mount_point()
        .map(Path::to_path_buf)
        .context("mount finished without a mount point")?;
    println!("Mounted {} at {}", bottle.name(), mount_point.display());

    if metadata.permissions.last_app != app {
        metadata.permissions.last_app = app.clone();
        if let Err(err) = service.save_metadata(&bottle, &metadata) {
            warn!("could not record last application: {err}");
        }
    }

    let outcome = launch(
        &mut session,
        &flatpak,
        &app,
        &mount_point,
        &metadata.permissions,
        args,
    )
    .await;

    session
        .release()
        .await
        .with_context(|| format!("failed to release {}", bottle.name()))?;
    watcher.abort();
    println!("Locked {}", bottle.name());

    let status = outcome?;
    if !status.success() {
        warn!("{app} exited with {status}");
    }
    Ok(status.code().unwrap_or(1))
}

async fn launch(
    session: &mut Session<UdisksHost>,
    flatpak: &Flatpak,
    app: &str,
    mount_point: &Path,
    permissions: &PermissionSet,
    extra: &[String],
) -> Result<ExitStatus> {
    sandbox::prepare_home(mount_point)?;
    let args = sandbox::flatpak_args(app, mount_point, permissions, extra);
    let child = flatpak
        .spawn(&args)
        .with_context(|| format!("failed to start {app}"))?;
    Ok(session.wait_for_app(child).await?)
}

fn prompt_new_password() -> Result<Zeroizing<String>> {
    let first = Zeroizing::new(prompt_password("New bottle password: ")?);
    ensure!(!first.is_empty(), "password must not be empty");
    let second = Zeroizing::new(prompt_password("Repeat password: ")?);
    ensure!(*first == *second, "passwords do not match");
    Ok(first)
}

fn parse_permission(name: &str) -> Result<Permission> {
    Permission::from_name(name).with_context(|| {
        let known: Vec<&str> = Permission::ALL.into_iter().map(Permission::name).collect();
        format!("unknown permission `{name}` (expected one of {})", known.join(", "))
    })
}

fn print_permissions(bottle: &BottleContainer, permissions: &PermissionSet) {
    println!("Permissions for {}", bottle.name());
    for perm in Permission::ALL {
        let state = if permissions.get(perm) { "on" } else { "off" };
        println!("  {:<10} {}", perm.name(), state);
    }
    if !permissions.last_app.is_empty() {
        println!("  last app   {}", permissions.last_app);
    }
}

fn print_status(status: &BottleStatus) {
    let bottle = &status.container;
    let state = &status.state;
    println!("Bottle      {}", bottle.name());
    println!("File        {}", bottle.file_path().display());
    println!("Identity    {}", bottle.identity_hash());
    println!("Mapper      {}", bottle.mapper_name());
    println!("Config      {}", bottle.config_path().display());
    println!("State       {}", state.phase());
    if let Some(device) = state.loop_device() {
        println!("Loop        {device}");
    }
    if let Some(device) = state.cleartext_device() {
        println!("Cleartext   {device}");
    }
    if let Some(mount_point) = state.mount_point() {
        println!("Mounted at  {}", mount_point.display());
    }
    match &status.metadata {
        Ok(metadata) => {
            println!("Credential  {}", metadata.credential.kind().label());
            if let Credential::HardwareKey(binding) = &metadata.credential {
                if let Some(hint) = &binding.device_hint {
                    println!("Key hint    {hint}");
                }
            }
            println!("Sandbox     {}", metadata.permissions.summary());
            if !metadata.permissions.last_app.is_empty() {
                println!("Last app    {}", metadata.permissions.last_app);
            }
        }
        Err(reason) => println!("Metadata    unreadable: {reason}"),
    }
}

/// Pretty-print a workflow report so humans can follow along.
fn print_report(report: WorkflowReport) {
    println!("{}", report.title);
    for event in report.events {
        println!("  [{}] {}", level_tag(event.level), event.message);
    }
}

/// Short tag used when printing workflow severity levels.
fn level_tag(level: WorkflowLevel) -> &'static str {
    match level {
        WorkflowLevel::Info => "INFO",
        WorkflowLevel::Success => "OK",
        WorkflowLevel::Warn => "WARN",
        WorkflowLevel::Security => "SEC",
    }
}
