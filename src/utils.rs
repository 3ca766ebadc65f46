use chrono::{DateTime, SecondsFormat, Utc};
use fnv::FnvHasher;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::hash::Hasher;
use std::net::{Ipv4Addr, SocketAddr};

/// Stable 64-bit fingerprint over a sequence of string fields.
///
/// Each field is followed by a separator byte so that `["ab", "c"]` and
/// `["a", "bc"]` hash differently.
pub fn fingerprint<'a>(fields: impl IntoIterator<Item = &'a str>) -> u64 {
    let mut hasher = FnvHasher::default();
    for field in fields {
        hasher.write(field.as_bytes());
        hasher.write_u8(0xff);
    }
    hasher.finish()
}

/// Mix an extra integer into an existing fingerprint.
pub fn mix(seed: u64, value: u64) -> u64 {
    let mut hasher = FnvHasher::with_key(seed);
    hasher.write_u64(value);
    hasher.finish()
}

/// Convert a k8s-openapi `Time`/`MicroTime` into chrono via its RFC 3339 wire form.
pub fn to_utc<T: Serialize>(time: &T) -> Option<DateTime<Utc>> {
    match serde_json::to_value(time).ok()? {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        _ => None,
    }
}

/// Inverse of [`to_utc`].
pub fn from_utc<T: DeserializeOwned>(time: DateTime<Utc>) -> Option<T> {
    serde_json::from_value(serde_json::Value::String(
        time.to_rfc3339_opts(SecondsFormat::Micros, true),
    ))
    .ok()
}

/// Parse a bind address. `":8080"` binds all interfaces, `"0"` disables the listener.
pub fn parse_bind_address(addr: &str) -> Result<Option<SocketAddr>, String> {
    let addr = addr.trim();
    if addr == "0" {
        return Ok(None);
    }
    if let Some(port) = addr.strip_prefix(':') {
        let port: u16 = port
            .parse()
            .map_err(|e| format!("invalid port '{}': {}", port, e))?;
        return Ok(Some(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))));
    }
    addr.parse::<SocketAddr>()
        .map(Some)
        .map_err(|e| format!("invalid bind address '{}': {}", addr, e))
}
