//! Process facts supplied by the host platform.
//!
//! Election and identity code only ever ask a [`Platform`]; anything that
//! depends on the operating system lives in [`OsPlatform`].

/// Capability for the few OS facts the protocol needs.
pub trait Platform: Send + Sync {
    /// Name of the user this process runs as. Empty if it cannot be determined.
    fn current_os_user(&self) -> String;

    fn process_id(&self) -> i64;
}

/// The real operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsPlatform;

impl Platform for OsPlatform {
    fn current_os_user(&self) -> String {
        let name = passwd_name().unwrap_or_default();
        if !name.is_empty() {
            return name;
        }
        std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_default()
    }

    fn process_id(&self) -> i64 {
        i64::from(std::process::id())
    }
}

#[cfg(unix)]
fn passwd_name() -> Option<String> {
    use std::ffi::CStr;

    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0 as libc::c_char; 4096];
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    // SAFETY: all out-pointers reference live stack/heap storage sized as passed.
    let rc = unsafe {
        libc::getpwuid_r(
            libc::geteuid(),
            &mut pwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() || pwd.pw_name.is_null() {
        return None;
    }

    // SAFETY: on success pw_name points into `buf` and is NUL-terminated.
    let name = unsafe { CStr::from_ptr(pwd.pw_name) };
    Some(name.to_string_lossy().into_owned())
}

#[cfg(not(unix))]
fn passwd_name() -> Option<String> {
    None
}

/// Fixed answers, for embedding and tests.
#[derive(Debug, Clone)]
pub struct StaticPlatform {
    pub user: String,
    pub pid: i64,
}

impl Platform for StaticPlatform {
    fn current_os_user(&self) -> String {
        self.user.clone()
    }

    fn process_id(&self) -> i64 {
        self.pid
    }
}
