//! Credential backends. Each produces raw key material for one unlock.

use crate::error::{BottleError, BottleResult};
use crate::keyfile::KeyMaterial;
use crate::store::HardwareKeyBinding;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bottle_provider::{
    AssertionRequest, Authenticator, AuthenticatorDevice, CredentialKind, CredentialRequest,
};
use log::{debug, info};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

/// Length of every hardware-derived key, bottle ID and salt.
pub const SECRET_LEN: usize = 32;

/// Produces key material for a bottle, or fails.
///
/// Orchestration only ever calls `key_material`; it never inspects which
/// backend it holds.
pub trait SecretProvider {
    fn kind(&self) -> CredentialKind;

    fn key_material(&self) -> BottleResult<KeyMaterial>;
}

/// Password supplied by the user. An empty password asks the volume daemon to
/// prompt on its own.
pub struct PasswordSecret {
    password: Zeroizing<String>,
}

impl PasswordSecret {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: Zeroizing::new(password.into()),
        }
    }

    pub fn external_prompt() -> Self {
        Self::new(String::new())
    }
}

impl SecretProvider for PasswordSecret {
    fn kind(&self) -> CredentialKind {
        CredentialKind::Password
    }

    fn key_material(&self) -> BottleResult<KeyMaterial> {
        Ok(Zeroizing::new(self.password.as_bytes().to_vec()))
    }
}

/// Secret derived from an attached authenticator's hmac-secret extension.
pub struct HardwareKeySecret<'a, A> {
    authenticator: &'a A,
    binding: HardwareKeyBinding,
    rp_id: String,
    device: Option<String>,
}

impl<'a, A> HardwareKeySecret<'a, A>
where
    A: Authenticator<Error = BottleError>,
{
    pub fn new(authenticator: &'a A, binding: HardwareKeyBinding, rp_id: impl Into<String>) -> Self {
        Self {
            authenticator,
            binding,
            rp_id: rp_id.into(),
            device: None,
        }
    }

    /// Pin a specific device path instead of relying on enumeration.
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }
}

impl<A> SecretProvider for HardwareKeySecret<'_, A>
where
    A: Authenticator<Error = BottleError>,
{
    fn kind(&self) -> CredentialKind {
        CredentialKind::HardwareKey
    }

    fn key_material(&self) -> BottleResult<KeyMaterial> {
        let preferred = self
            .device
            .as_deref()
            .or(self.binding.device_hint.as_deref());
        let device = select_device(self.authenticator, preferred, self.device.is_some())?;
        info!("touch the authenticator at {} to unlock", device.path);
        derive_secret(self.authenticator, &device.path, &self.binding, &self.rp_id)
    }
}

/// Pick the authenticator to talk to.
///
/// Zero devices is [`BottleError::NoAuthenticator`]. A preferred path wins
/// when it is currently attached; otherwise more than one device is
/// ambiguous. With `strict`, a preferred path that is not attached is an
/// error rather than a fallback.
pub fn select_device<A>(
    authenticator: &A,
    preferred: Option<&str>,
    strict: bool,
) -> BottleResult<AuthenticatorDevice>
where
    A: Authenticator<Error = BottleError>,
{
    let mut devices = authenticator.devices()?;
    debug!("enumerated {} authenticator(s)", devices.len());
    if devices.is_empty() {
        return Err(BottleError::NoAuthenticator);
    }

    if let Some(wanted) = preferred {
        if let Some(idx) = devices.iter().position(|dev| dev.path == wanted) {
            return Ok(devices.swap_remove(idx));
        }
        if strict {
            return Err(BottleError::NoAuthenticator);
        }
    }

    if devices.len() > 1 {
        return Err(BottleError::AmbiguousAuthenticator(
            devices.into_iter().map(|dev| dev.path).collect(),
        ));
    }
    Ok(devices.remove(0))
}

/// Run one hmac-secret assertion and enforce the exact key length.
pub fn derive_secret<A>(
    authenticator: &A,
    device: &str,
    binding: &HardwareKeyBinding,
    rp_id: &str,
) -> BottleResult<KeyMaterial>
where
    A: Authenticator<Error = BottleError>,
{
    let request = AssertionRequest {
        challenge: &binding.bottle_id,
        rp_id,
        credential_id: &binding.credential_id,
        salt: &binding.salt,
    };
    let secret = Zeroizing::new(authenticator.hmac_secret(device, &request)?);
    if secret.len() != SECRET_LEN {
        return Err(BottleError::InvalidSecret(format!(
            "hmac-secret must be {SECRET_LEN} bytes, authenticator returned {}",
            secret.len()
        )));
    }
    Ok(secret)
}

/// Result of enrolling a new bottle with an authenticator.
pub struct Enrollment {
    pub binding: HardwareKeyBinding,
    pub key: KeyMaterial,
}

/// Create a credential for a new bottle and derive its first key.
///
/// Needs two touches: one for credential creation, one for the assertion.
pub fn enroll_hardware_key<A>(
    authenticator: &A,
    rp_id: &str,
    user_name: &str,
    device: Option<&str>,
) -> BottleResult<Enrollment>
where
    A: Authenticator<Error = BottleError>,
{
    let device = select_device(authenticator, device, device.is_some())?;
    let bottle_id = random_b64();

    info!("touch the authenticator at {} to create a credential", device.path);
    let credential_id = authenticator.make_credential(
        &device.path,
        &CredentialRequest {
            challenge: &bottle_id,
            rp_id,
            user_name,
            user_id: &bottle_id,
        },
    )?;
    if credential_id.trim().is_empty() {
        return Err(BottleError::MalformedOutput {
            operation: "make credential".into(),
            expected: "credential id",
            output: String::new(),
        });
    }

    let binding = HardwareKeyBinding {
        bottle_id,
        credential_id: credential_id.trim().to_string(),
        salt: random_b64(),
        device_hint: Some(device.path.clone()),
    };

    info!("touch the authenticator again to derive the bottle key");
    let key = derive_secret(authenticator, &device.path, &binding, rp_id)?;
    Ok(Enrollment { binding, key })
}

fn random_b64() -> String {
    let mut bytes = Zeroizing::new([0u8; SECRET_LEN]);
    OsRng.fill_bytes(&mut bytes[..]);
    STANDARD.encode(&bytes[..])
}
