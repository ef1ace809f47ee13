//! Core building blocks for bottle-launch.
//!
//! Identity, metadata persistence, credential backends and the mount/unmount
//! state machines live here so the binaries only deal with prompts and
//! process plumbing.

pub mod bottle;
pub mod command;
pub mod config;
pub mod error;
pub mod keyfile;
pub mod lifecycle;
pub mod logging;
pub mod provider;
pub mod secret;
pub mod service;
pub mod store;
pub mod workflow;

pub use bottle::{BottleContainer, BOTTLE_EXTENSION};
pub use config::{Escalation, LaunchConfig};
pub use error::{BottleError, BottleResult};
pub use lifecycle::{ChildProcess, LifecycleCoordinator, ProcessHandle, TerminationSignal};
pub use provider::BottleHost;
pub use secret::{HardwareKeySecret, PasswordSecret, SecretProvider};
pub use service::{BottleService, BottleStatus, CreateRequest, NewCredential};
pub use store::{BottleMetadata, Credential, HardwareKeyBinding, Permission, PermissionSet};
