#![forbid(unsafe_code)]

//! FIDO2 authenticator access through `fido2-token`, `fido2-cred` and
//! `fido2-assert` from libfido2.
//!
//! Every request is written to the tool's stdin one field per line. Replies
//! are read at fixed line offsets.

mod parse;

pub use parse::{parse_assertion, parse_credential, parse_device_list};

use bottle_core::command::{Input, ToolCommand};
use bottle_core::config::{resolve_binary, LaunchConfig};
use bottle_core::error::{BottleError, BottleResult};
use bottle_provider::{Authenticator, AssertionRequest, AuthenticatorDevice, CredentialRequest};
use zeroize::Zeroizing;

const DEFAULT_TOKEN_PATHS: &[&str] = &["/usr/bin/fido2-token", "/usr/local/bin/fido2-token"];
const DEFAULT_CRED_PATHS: &[&str] = &["/usr/bin/fido2-cred", "/usr/local/bin/fido2-cred"];
const DEFAULT_ASSERT_PATHS: &[&str] = &["/usr/bin/fido2-assert", "/usr/local/bin/fido2-assert"];

/// Key type requested for every credential.
pub const KEY_TYPE: &str = "es256";

#[derive(Debug, Clone)]
pub struct Fido2Tools {
    token: ToolCommand,
    cred: ToolCommand,
    assert: ToolCommand,
}

impl Fido2Tools {
    /// Resolve all three tools. Fails with `MissingTool` when libfido2's
    /// utilities are not installed.
    pub fn from_config(config: &LaunchConfig) -> BottleResult<Self> {
        let tools = &config.tools;
        let token = resolve_binary(tools.fido2_token.as_deref(), DEFAULT_TOKEN_PATHS, "fido2-token")?;
        let cred = resolve_binary(tools.fido2_cred.as_deref(), DEFAULT_CRED_PATHS, "fido2-cred")?;
        let assert = resolve_binary(
            tools.fido2_assert.as_deref(),
            DEFAULT_ASSERT_PATHS,
            "fido2-assert",
        )?;
        Ok(Self {
            token: ToolCommand::new(token),
            cred: ToolCommand::new(cred),
            assert: ToolCommand::new(assert),
        })
    }
}

fn lines(fields: &[&str]) -> Zeroizing<Vec<u8>> {
    let mut payload = Zeroizing::new(Vec::new());
    for field in fields {
        payload.extend_from_slice(field.as_bytes());
        payload.push(b'\n');
    }
    payload
}

impl Authenticator for Fido2Tools {
    type Error = BottleError;

    fn devices(&self) -> BottleResult<Vec<AuthenticatorDevice>> {
        let reply = self.token.run_checked("fido2-token -L", &["-L"], Input::None)?;
        Ok(parse_device_list(&reply.stdout))
    }

    fn make_credential(&self, device: &str, request: &CredentialRequest<'_>) -> BottleResult<String> {
        let input = lines(&[
            request.challenge,
            request.rp_id,
            request.user_name,
            request.user_id,
        ]);
        let reply = self.cred.run_checked(
            &format!("fido2-cred -M {device}"),
            &["-M", "-h", device, KEY_TYPE],
            Input::Bytes(&input[..]),
        )?;
        parse_credential(&reply.stdout)
    }

    fn hmac_secret(&self, device: &str, request: &AssertionRequest<'_>) -> BottleResult<Vec<u8>> {
        let input = lines(&[
            request.challenge,
            request.rp_id,
            request.credential_id,
            request.salt,
        ]);
        // Blocks until the user touches the key.
        let reply = self.assert.run_checked(
            &format!("fido2-assert -G {device}"),
            &["-G", "-h", device, KEY_TYPE],
            Input::Bytes(&input[..]),
        )?;
        parse_assertion(&reply.stdout)
    }
}
