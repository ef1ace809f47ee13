#![forbid(unsafe_code)]

//! Contracts shared between the bottle lifecycle engine and its collaborators.
//!
//! Nothing in here talks to the host. Concrete implementations live in
//! `bottle-udisks` (volumes, locator, provisioning) and `bottle-fido2`
//! (hardware authenticators) so the orchestration logic in `bottle-core`
//! can be exercised against in-memory fakes.

pub mod authenticator;
pub mod state;
pub mod volume;

pub use authenticator::{AssertionRequest, Authenticator, AuthenticatorDevice, CredentialRequest};
pub use state::{MountPhase, MountState};
pub use volume::{DeviceLocator, ProvisionRequest, VolumeManager, VolumeProvisioner};

/// Identifies which credential backend unlocks a bottle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Password,
    HardwareKey,
}

impl CredentialKind {
    pub fn label(self) -> &'static str {
        match self {
            CredentialKind::Password => "password",
            CredentialKind::HardwareKey => "hardware key",
        }
    }
}
