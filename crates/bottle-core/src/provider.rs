//! Host contracts used by bottle workflows.
//!
//! The traits themselves live in `bottle-provider`; this module pins their
//! error type to [`BottleError`] and bundles them for the service layer.

use crate::error::BottleError;

pub use bottle_provider::{
    AssertionRequest, Authenticator, AuthenticatorDevice, CredentialKind, CredentialRequest,
    DeviceLocator, MountPhase, MountState, ProvisionRequest, VolumeManager, VolumeProvisioner,
};

/// Everything the service needs from the host: probing, volume operations and
/// first-time provisioning.
pub trait BottleHost:
    DeviceLocator<Error = BottleError>
    + VolumeManager<Error = BottleError>
    + VolumeProvisioner<Error = BottleError>
{
}

impl<T> BottleHost for T where
    T: DeviceLocator<Error = BottleError>
        + VolumeManager<Error = BottleError>
        + VolumeProvisioner<Error = BottleError>
{
}
