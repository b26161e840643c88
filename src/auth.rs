//! Upgrade gate for both WebSocket endpoints.
//!
//! `/cdp` is protected by an optional shared token compared in constant
//! time; `/extension` by a fixed allowlist of extension ids carried in the
//! `Origin` header. Every rejection happens before the WebSocket handshake
//! completes and logs a category, never the supplied credential.

use subtle::ConstantTimeEq;

/// Extension ids admitted on `/extension` when no override is configured:
/// the production id first, development ids after it.
pub const DEFAULT_EXTENSION_IDS: &[&str] = &[
    "jfeammnjpkecdekppnclgkkffahnhfhe",
    "hkcdbdlmhmnfjacbgcgmnkaphkmnmoio",
    "pbanhhagfhmkjkglompedakpnpbkbpoe",
];

const EXTENSION_SCHEME: &str = "chrome-extension://";

/// Why an upgrade was refused. The name doubles as the log category.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateRejection {
    NoToken,
    BadToken,
    BadOrigin,
    UnknownExtension,
}

impl GateRejection {
    pub fn category(self) -> &'static str {
        match self {
            GateRejection::NoToken => "no-token",
            GateRejection::BadToken => "bad-token",
            GateRejection::BadOrigin => "bad-origin",
            GateRejection::UnknownExtension => "unknown-ext",
        }
    }
}

/// Check a `/cdp` upgrade. `expected` is the configured token (if any) and
/// `supplied` the `token` query parameter.
pub fn check_client_token(
    expected: Option<&str>,
    supplied: Option<&str>,
) -> Result<(), GateRejection> {
    let Some(expected) = expected else {
        // Localhost trust model: no token configured, everyone is admitted.
        return Ok(());
    };
    let Some(supplied) = supplied else {
        return Err(GateRejection::NoToken);
    };
    if token_eq(expected.as_bytes(), supplied.as_bytes()) {
        Ok(())
    } else {
        Err(GateRejection::BadToken)
    }
}

/// Constant-time token comparison. A length mismatch short-circuits, but
/// equal-length candidates are always compared over every byte.
fn token_eq(expected: &[u8], supplied: &[u8]) -> bool {
    expected.ct_eq(supplied).unwrap_u8() == 1
}

/// Check an `/extension` upgrade. Returns the validated extension id.
pub fn check_extension_origin<'a>(
    allowlist: &'a [String],
    origin: Option<&str>,
) -> Result<&'a str, GateRejection> {
    let Some(origin) = origin else {
        return Err(GateRejection::BadOrigin);
    };
    let Some(id) = origin.strip_prefix(EXTENSION_SCHEME) else {
        return Err(GateRejection::BadOrigin);
    };
    let id = id.trim_end_matches('/');
    allowlist
        .iter()
        .find(|allowed| allowed.as_str() == id)
        .map(|allowed| allowed.as_str())
        .ok_or(GateRejection::UnknownExtension)
}
