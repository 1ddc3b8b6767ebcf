//! Identity of the user running the mount

use std::ffi::CStr;

/// Upper bound for the passwd lookup buffer.
const MAX_PASSWD_BUFFER: usize = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("No passwd entry for uid {0}")]
    UnknownUser(u32),
    #[error("Failed to look up uid {uid}: {source}")]
    Lookup {
        uid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Real user and group of this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub uid: u32,
    pub gid: u32,
    pub name: String,
}

impl UserIdentity {
    /// Resolves the real uid/gid and the matching account name.
    pub fn current() -> Result<Self, IdentityError> {
        // SAFETY: getuid() and getgid() have no preconditions and cannot fail.
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        let name = lookup_user_name(uid)?;
        Ok(Self { uid, gid, name })
    }
}

fn lookup_user_name(uid: u32) -> Result<String, IdentityError> {
    let mut buffer: Vec<libc::c_char> = vec![0; 1024];
    loop {
        // SAFETY: passwd is plain data; getpwuid_r fills it with pointers
        // into `buffer`, which outlives every read below.
        let mut entry: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let rc = unsafe {
            libc::getpwuid_r(
                uid,
                &mut entry,
                buffer.as_mut_ptr(),
                buffer.len(),
                &mut result,
            )
        };

        if rc == libc::ERANGE && buffer.len() < MAX_PASSWD_BUFFER {
            buffer.resize(buffer.len() * 2, 0);
            continue;
        }
        if rc != 0 {
            return Err(IdentityError::Lookup {
                uid,
                source: std::io::Error::from_raw_os_error(rc),
            });
        }
        if result.is_null() || entry.pw_name.is_null() {
            return Err(IdentityError::UnknownUser(uid));
        }

        // SAFETY: pw_name is a NUL-terminated string inside `buffer`.
        let name = unsafe { CStr::from_ptr(entry.pw_name) };
        return Ok(name.to_string_lossy().into_owned());
    }
}
