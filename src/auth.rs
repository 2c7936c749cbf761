//! Authentication parameter derivation.
//!
//! Every request carries the base parameter set built here: username plus
//! either a single-use salted token or the legacy obfuscated password,
//! followed by protocol version and client identifier. Salt generation
//! failure aborts the request rather than degrading to the weaker mode.

use crate::error::SyncError;

/// Protocol version advertised in the `v` parameter.
pub const API_VERSION: &str = "1.16.1";
/// Client identifier advertised in the `c` parameter.
pub const CLIENT_ID: &str = "subtide";

/// Length in bytes of the per-request token salt.
const SALT_LEN: usize = 64;

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|value| format!("{value:02x}")).collect()
}

fn make_salt() -> Result<String, SyncError> {
    let mut bytes = [0u8; SALT_LEN];
    getrandom::fill(&mut bytes)
        .map_err(|err| SyncError::Auth(format!("salt generation failed: {err}")))?;
    Ok(hex_encode(&bytes))
}

/// Builds the authenticated base parameters for one request.
///
/// Token mode sends `t` (md5 of password+salt) and `s`; legacy mode sends
/// `p` as `enc:` followed by the hex-encoded password. The two modes are
/// mutually exclusive by construction.
pub fn base_parameters(
    username: &str,
    password: &str,
    use_token_auth: bool,
) -> Result<Vec<(String, String)>, SyncError> {
    let mut parameters = vec![("u".to_string(), username.to_string())];
    if use_token_auth {
        let salt = make_salt()?;
        let token = format!("{:x}", md5::compute(format!("{password}{salt}")));
        parameters.push(("t".to_string(), token));
        parameters.push(("s".to_string(), salt));
    } else {
        let obfuscated = format!("enc:{}", hex_encode(password.as_bytes()));
        parameters.push(("p".to_string(), obfuscated));
    }
    parameters.push(("v".to_string(), API_VERSION.to_string()));
    parameters.push(("c".to_string(), CLIENT_ID.to_string()));
    Ok(parameters)
}
