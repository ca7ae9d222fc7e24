//! Native library loading
//!
//! `dlopen` with lazy binding. Library-name translation maps the common
//! spellings between host families (`libfoo.so[.N]` ↔ `libfoo.dylib`, plus
//! the usual libc/libm aliases), so scripts written against one platform's
//! names load on the other.
//!
//! Path validation rejects empty paths and traversal components (`..`,
//! `/./`, `/../`). World-writable parent directories are *warned about*,
//! not rejected: loading from /tmp is legitimate in tests and tooling.
//!
//! Handles are never `dlclose`d: resolved code pointers live inside
//! `NativeFn` values with process lifetime, so unloading would leave them
//! dangling.

use super::FfiError;
use std::ffi::{CStr, CString};
use std::os::raw::c_void;

/// Standard-library aliases translated per host family.
const DARWIN_ALIASES: &[(&str, &str)] = &[
    ("libc.so.6", "libSystem.B.dylib"),
    ("libc.so", "libSystem.B.dylib"),
    ("libm.so.6", "libSystem.B.dylib"),
    ("libm.so", "libSystem.B.dylib"),
    ("libdl.so.2", "libSystem.B.dylib"),
    ("libpthread.so.0", "libSystem.B.dylib"),
];

const LINUX_ALIASES: &[(&str, &str)] = &[
    ("libSystem.B.dylib", "libc.so.6"),
    ("libSystem.dylib", "libc.so.6"),
];

/// Reject empty and traversal-bearing paths.
pub fn validate_path(path: &str) -> Result<(), FfiError> {
    if path.is_empty() {
        return Err(FfiError::EmptyPath);
    }
    if path == ".."
        || path.starts_with("../")
        || path.ends_with("/..")
        || path.contains("/../")
        || path.contains("/./")
    {
        return Err(FfiError::UnsafePath(path.to_string()));
    }
    Ok(())
}

/// Warn (once per call) when the containing directory is world-writable.
fn warn_world_writable(path: &str) {
    #[cfg(unix)]
    {
        let dir = match path.rfind('/') {
            Some(0) => "/".to_string(),
            Some(pos) => path[..pos].to_string(),
            None => return, // bare name: resolved by the loader search path
        };
        let Ok(cdir) = CString::new(dir.clone()) else {
            return;
        };
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::stat(cdir.as_ptr(), &mut stat) } == 0
            && stat.st_mode & libc::S_IWOTH != 0
        {
            tracing::warn!(directory = %dir, "loading native library from a world-writable directory");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

/// Map a library name onto the host's spelling.
pub fn translate_path(path: &str) -> String {
    let (file, dir) = match path.rfind('/') {
        Some(pos) => (&path[pos + 1..], &path[..=pos]),
        None => (path, ""),
    };

    let aliases: &[(&str, &str)] = if cfg!(target_os = "macos") {
        DARWIN_ALIASES
    } else {
        LINUX_ALIASES
    };
    for (from, to) in aliases {
        if file == *from {
            return format!("{}{}", dir, to);
        }
    }

    if cfg!(target_os = "macos") {
        // libfoo.so / libfoo.so.3 → libfoo.dylib
        if let Some(stem) = file.strip_suffix(".so") {
            return format!("{}{}.dylib", dir, stem);
        }
        if let Some(pos) = file.find(".so.") {
            let version_ok = file[pos + 4..].split('.').all(|part| {
                !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit())
            });
            if version_ok {
                return format!("{}{}.dylib", dir, &file[..pos]);
            }
        }
    } else if let Some(stem) = file.strip_suffix(".dylib") {
        return format!("{}{}.so", dir, stem);
    }
    path.to_string()
}

/// An open native library with lazy symbol binding.
#[derive(Debug)]
pub struct Library {
    handle: *mut c_void,
    pub path: String,
}

unsafe impl Send for Library {}
unsafe impl Sync for Library {}

impl Library {
    /// Validate, translate and `dlopen` the library.
    pub fn open(path: &str) -> Result<Library, FfiError> {
        validate_path(path)?;
        let resolved = translate_path(path);
        warn_world_writable(&resolved);

        let cpath = CString::new(resolved.clone()).map_err(|_| {
            FfiError::UnsafePath(path.to_string())
        })?;
        let handle = unsafe { libc::dlopen(cpath.as_ptr(), libc::RTLD_LAZY) };
        if handle.is_null() {
            let detail = unsafe {
                let err = libc::dlerror();
                if err.is_null() {
                    "unknown dlopen failure".to_string()
                } else {
                    CStr::from_ptr(err).to_string_lossy().into_owned()
                }
            };
            return Err(FfiError::LoadFailed {
                path: resolved,
                detail,
            });
        }
        tracing::debug!(path = %resolved, "native library loaded");
        Ok(Library {
            handle,
            path: resolved,
        })
    }

    /// Resolve a symbol; `None` (not an error) when absent, so callers can
    /// declare many optional externs.
    pub fn sym(&self, name: &str) -> Option<*mut c_void> {
        let cname = CString::new(name).ok()?;
        let ptr = unsafe { libc::dlsym(self.handle, cname.as_ptr()) };
        if ptr.is_null() { None } else { Some(ptr) }
    }
}
