//! Contract for FIDO2 authenticators exposing the hmac-secret extension.

use std::error::Error;

/// One attached authenticator as reported by enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatorDevice {
    /// Device node, e.g. `/dev/hidraw3`.
    pub path: String,
    /// Vendor/product description as printed by the enumeration tool.
    pub description: String,
}

/// Input for credential creation.
#[derive(Debug, Clone, Copy)]
pub struct CredentialRequest<'a> {
    /// Base64 challenge (client data hash); the bottle ID.
    pub challenge: &'a str,
    pub rp_id: &'a str,
    pub user_name: &'a str,
    /// Base64 user handle; the bottle ID as well.
    pub user_id: &'a str,
}

/// Input for an hmac-secret assertion.
#[derive(Debug, Clone, Copy)]
pub struct AssertionRequest<'a> {
    pub challenge: &'a str,
    pub rp_id: &'a str,
    pub credential_id: &'a str,
    /// Base64 hmac-secret salt.
    pub salt: &'a str,
}

/// Access to attached authenticators. Both credential creation and assertion
/// block until the user touches the device.
pub trait Authenticator {
    type Error: Error + Send + Sync + 'static;

    fn devices(&self) -> Result<Vec<AuthenticatorDevice>, Self::Error>;

    /// Create a credential with hmac-secret enabled and return its ID.
    fn make_credential(
        &self,
        device: &str,
        request: &CredentialRequest<'_>,
    ) -> Result<String, Self::Error>;

    /// Return the decoded hmac-secret output. Length is not validated here.
    fn hmac_secret(&self, device: &str, request: &AssertionRequest<'_>)
        -> Result<Vec<u8>, Self::Error>;
}
