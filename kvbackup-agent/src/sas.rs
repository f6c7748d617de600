//! Container-scoped shared access signatures.

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::backend::abs::API_VERSION;

type HmacSha256 = Hmac<Sha256>;

/// Read, add, create, write, delete, list. Order is fixed by the service.
pub const BACKUP_PERMISSIONS: &str = "racwdl";
pub const DEFAULT_EXPIRY_DAYS: i64 = 5 * 365;

/// Issue a container SAS token granting the permissions the backup
/// operator needs, signed with the base64 `account_key`.
pub fn generate_container_sas(
    account_name: &str,
    account_key: &str,
    container: &str,
    expiry: DateTime<Utc>,
) -> Result<String, base64::DecodeError> {
    let key = base64::engine::general_purpose::STANDARD.decode(account_key.trim())?;
    let expiry = expiry.format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let resource = format!("/blob/{}/{}", account_name, container);

    let string_to_sign = [
        BACKUP_PERMISSIONS,                                  // sp
        "",                                                  // st
        expiry.as_str(),                                     // se
        resource.as_str(),                                   // canonical resource
        "",                                                  // si
        "",                                                  // sip
        "https",                                             // spr
        API_VERSION,                                         // sv
        "c",                                                 // sr
        "",                                                  // snapshot time
        "",                                                  // rscc
        "",                                                  // rscd
        "",                                                  // rsce
        "",                                                  // rscl
        "",                                                  // rsct
    ]
    .join("\n");

    let mut mac = HmacSha256::new_from_slice(&key).expect("HMAC key length ok");
    mac.update(string_to_sign.as_bytes());
    let sig = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    Ok(format!(
        "sv={}&se={}&sr=c&sp={}&spr=https&sig={}",
        API_VERSION,
        urlencoding::encode(&expiry),
        BACKUP_PERMISSIONS,
        urlencoding::encode(&sig)
    ))
}

/// Expiry `days` from now.
pub fn expiry_in(days: i64) -> DateTime<Utc> {
    Utc::now() + Duration::days(days)
}

/// Reduce a SAS URI or `?`-prefixed token to the bare query string.
pub fn strip_token(token: &str) -> &str {
    let token = token.trim();
    match token.find('?') {
        Some(pos) => &token[pos + 1..],
        None => token,
    }
}
