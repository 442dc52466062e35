// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

//! A small hand-rolled logger, in the style of the teacher's
//! `zerotier-system-service::log::Log` (referenced throughout `service.rs`
//! via `crate::log::Log` and the `l!`/`d!` macros, though `log.rs` itself was
//! not among the retrieved example files). Deliberately not the `log` or
//! `tracing` crates: this workspace's only logging consumer is `zt-service`
//! itself, and the teacher's own service crate rolls its own rather than
//! pulling one in.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;

struct Inner {
    path: PathBuf,
    file: Option<File>,
    max_size: i64,
    stderr: bool,
    debug: bool,
    prefix: String,
}

pub struct Log {
    inner: Mutex<Inner>,
}

impl Log {
    pub fn new<P: Into<PathBuf>>(path: P, max_size: i64, stderr: bool, debug: bool, prefix: &str) -> Self {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path).ok();
        Self { inner: Mutex::new(Inner { path, file, max_size, stderr, debug, prefix: prefix.to_string() }) }
    }

    fn write_line(&self, level: &str, msg: &str) {
        let mut inner = self.inner.lock();
        let line = format!("[{}] {}{}: {}\n", zt_utils::ms_since_epoch(), inner.prefix, level, msg);
        if inner.stderr {
            let _ = std::io::stderr().write_all(line.as_bytes());
        }
        self.rotate_if_needed(&mut inner);
        if let Some(f) = inner.file.as_mut() {
            let _ = f.write_all(line.as_bytes());
        }
    }

    fn rotate_if_needed(&self, inner: &mut Inner) {
        if inner.max_size <= 0 {
            return;
        }
        if let Ok(meta) = std::fs::metadata(&inner.path) {
            if meta.len() as i64 >= inner.max_size {
                let _ = std::fs::remove_file(&inner.path);
                inner.file = OpenOptions::new().create(true).append(true).open(&inner.path).ok();
            }
        }
    }

    pub fn info(&self, msg: String) {
        self.write_line("INFO", &msg);
    }

    pub fn debug(&self, msg: String) {
        if self.inner.lock().debug {
            self.write_line("DEBUG", &msg);
        }
    }

    pub fn fatal(&self, msg: String) {
        self.write_line("FATAL", &msg);
    }

    pub fn set_max_size(&self, max_size: i64) {
        self.inner.lock().max_size = max_size;
    }

    pub fn set_log_to_stderr(&self, stderr: bool) {
        self.inner.lock().stderr = stderr;
    }

    pub fn set_debug(&self, debug: bool) {
        self.inner.lock().debug = debug;
    }
}

/// Log at info level, printf-style.
macro_rules! l {
    ($log:expr, $($arg:tt)*) => {
        $log.info(format!($($arg)*))
    };
}

/// Log at debug level, printf-style; suppressed unless debug logging is enabled.
macro_rules! d {
    ($log:expr, $($arg:tt)*) => {
        $log.debug(format!($($arg)*))
    };
}

pub use d;
pub use l;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_info_and_suppresses_debug_by_default() {
        let dir = std::env::temp_dir().join(format!("zt-service-log-test-{}", std::process::id()));
        let log = Log::new(&dir, 0, false, false, "");
        l!(log, "hello {}", 1);
        d!(log, "should not appear");
        let contents = std::fs::read_to_string(&dir).unwrap();
        assert!(contents.contains("hello 1"));
        assert!(!contents.contains("should not appear"));
        let _ = std::fs::remove_file(&dir);
    }
}
