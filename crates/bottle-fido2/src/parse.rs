//! Parsers for libfido2 tool output.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bottle_core::error::{BottleError, BottleResult};
use bottle_provider::AuthenticatorDevice;

/// Zero-based line of the credential ID in `fido2-cred -M` output.
const CREDENTIAL_ID_LINE: usize = 4;
/// Minimum line count of a `fido2-assert -G` reply carrying hmac-secret.
const ASSERTION_MIN_LINES: usize = 5;

fn output_lines(stdout: &str) -> Vec<&str> {
    stdout.trim().lines().collect()
}

/// `fido2-token -L` prints `path: description` per device.
pub fn parse_device_list(stdout: &str) -> Vec<AuthenticatorDevice> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let (path, description) = line.split_once(':').unwrap_or((line, ""));
            AuthenticatorDevice {
                path: path.trim().to_string(),
                description: description.trim().to_string(),
            }
        })
        .collect()
}

pub fn parse_credential(stdout: &str) -> BottleResult<String> {
    let lines = output_lines(stdout);
    lines
        .get(CREDENTIAL_ID_LINE)
        .map(|line| line.trim())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| BottleError::MalformedOutput {
            operation: "fido2-cred".into(),
            expected: "credential id",
            output: format!("{} line(s)", lines.len()),
        })
}

/// The hmac-secret output is the last line, base64 encoded.
///
/// `stdout` should be the runner's wiping buffer; nothing here copies the
/// encoded line. The decoded length is checked by the caller.
pub fn parse_assertion(stdout: &str) -> BottleResult<Vec<u8>> {
    let lines = output_lines(stdout);
    if lines.len() < ASSERTION_MIN_LINES {
        return Err(BottleError::MalformedOutput {
            operation: "fido2-assert".into(),
            expected: "hmac-secret",
            output: format!("{} line(s)", lines.len()),
        });
    }
    let encoded = lines[lines.len() - 1].trim();
    STANDARD
        .decode(encoded)
        .map_err(|err| BottleError::InvalidSecret(format!("hmac-secret is not base64: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN_LIST: &str = "\
/dev/hidraw3: vendor=0x1050, product=0x0407 (Yubico YubiKey OTP+FIDO+CCID)
/dev/hidraw7: vendor=0x20a0, product=0x42b1 (Nitrokey 3)

";

    #[test]
    fn device_list_splits_on_first_colon() {
        let devices = parse_device_list(TOKEN_LIST);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].path, "/dev/hidraw3");
        assert_eq!(
            devices[0].description,
            "vendor=0x1050, product=0x0407 (Yubico YubiKey OTP+FIDO+CCID)"
        );
        assert_eq!(devices[1].path, "/dev/hidraw7");
    }

    #[test]
    fn device_without_description_is_kept() {
        let devices = parse_device_list("/dev/hidraw0\n");
        assert_eq!(devices[0].path, "/dev/hidraw0");
        assert!(devices[0].description.is_empty());
    }

    #[test]
    fn empty_listing_means_no_devices() {
        assert!(parse_device_list("\n  \n").is_empty());
    }

    #[test]
    fn credential_id_is_fifth_line() {
        let out = "Y2RoCg==\nbottle-launch\nbottle-user\nAUTHDATA\nQ1JFRElE\nSIG\nX509\n";
        assert_eq!(parse_credential(out).unwrap(), "Q1JFRElE");
    }

    #[test]
    fn short_credential_output_is_malformed() {
        let err = parse_credential("a\nb\nc\nd\n").unwrap_err();
        assert!(matches!(
            err,
            BottleError::MalformedOutput {
                expected: "credential id",
                ..
            }
        ));
    }

    #[test]
    fn assertion_secret_is_last_line() {
        let secret = STANDARD.encode([9u8; 32]);
        let out = format!("Y2RoCg==\nbottle-launch\nAUTHDATA\nSIG\n{secret}\n");
        assert_eq!(parse_assertion(&out).unwrap(), vec![9u8; 32]);
    }

    #[test]
    fn assertion_with_extra_lines_still_uses_last() {
        let secret = STANDARD.encode([1u8; 32]);
        let out = format!("cdh\nrp\nauth\nsig\nuser\n{secret}\n");
        assert_eq!(parse_assertion(&out).unwrap(), vec![1u8; 32]);
    }

    #[test]
    fn short_assertion_output_is_malformed() {
        let err = parse_assertion("cdh\nrp\nauth\nsig\n").unwrap_err();
        assert!(matches!(err, BottleError::MalformedOutput { .. }));
    }

    #[test]
    fn undecodable_secret_is_rejected() {
        let err = parse_assertion("cdh\nrp\nauth\nsig\n!!not-base64!!\n").unwrap_err();
        assert!(matches!(err, BottleError::InvalidSecret(_)));
    }
}
