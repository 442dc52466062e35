// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! Small filesystem and CLI-validation helpers, in the style of the teacher's
//! `zerotier-system-service::utils` (referenced throughout `datadir.rs` and
//! `main.rs` but not itself present in the retrieved example files).

use std::fs;
use std::io;
use std::path::Path;

pub const DEFAULT_FILE_IO_READ_LIMIT: usize = 1024 * 1024;

/// Read a file, refusing anything larger than `limit` bytes so a corrupt or
/// hostile on-disk object can't exhaust memory.
pub fn read_limit<P: AsRef<Path>>(path: P, limit: usize) -> io::Result<Vec<u8>> {
    let path = path.as_ref();
    let meta = fs::metadata(path)?;
    if meta.len() as usize > limit {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "file exceeds read limit"));
    }
    fs::read(path)
}

/// Restrict a file to owner-read/write only. A no-op (returning `true`) on
/// platforms without POSIX permission bits.
#[cfg(unix)]
pub fn fs_restrict_permissions<P: AsRef<Path>>(path: P) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).is_ok()
}

#[cfg(not(unix))]
pub fn fs_restrict_permissions<P: AsRef<Path>>(_path: P) -> bool {
    true
}

pub fn to_json_pretty<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

pub fn is_valid_port(s: &str) -> Result<(), String> {
    s.parse::<u16>().map(|_| ()).map_err(|_| format!("'{}' is not a valid port number", s))
}

pub fn is_valid_bool(s: &str) -> Result<(), String> {
    match s {
        "true" | "false" | "1" | "0" => Ok(()),
        _ => Err(format!("'{}' is not a valid boolean", s)),
    }
}
