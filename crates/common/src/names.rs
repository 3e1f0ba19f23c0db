//! Tunnel name validation
//!
//! A mesh name becomes both an interface name and a file stem under the tunnel
//! directory, so it is held to the strictest platform rules.

use crate::{Error, Result};
use std::path::Path;

const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Suffix of tunnel configuration files
pub const CONFIG_SUFFIX: &str = ".conf";

const MAX_NAME_LEN: usize = 32;

fn is_reserved(name: &str) -> bool {
    let stem = name.rsplit_once('.').map(|(stem, _)| stem);
    RESERVED_NAMES
        .iter()
        .any(|r| name.eq_ignore_ascii_case(r) || stem.is_some_and(|s| s.eq_ignore_ascii_case(r)))
}

fn is_allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '=' | '+' | '.' | '-')
}

/// True if `name` can safely be used as a tunnel name
pub fn tunnel_name_is_valid(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name != "."
        && name != ".."
        && name.chars().all(is_allowed_char)
        && !is_reserved(name)
}

/// Validate a tunnel name, returning it on success
pub fn validate_tunnel_name(name: &str) -> Result<&str> {
    if tunnel_name_is_valid(name) {
        Ok(name)
    } else {
        Err(Error::InvalidTunnelName(name.to_string()))
    }
}

/// Extract the tunnel name from a configuration file path
pub fn name_from_path(path: &Path) -> Result<String> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidTunnelName(path.display().to_string()))?;

    let name = file_name
        .strip_suffix(CONFIG_SUFFIX)
        .ok_or_else(|| Error::InvalidTunnelName(file_name.to_string()))?;

    validate_tunnel_name(name).map(str::to_string)
}
