//! Scoped filesystem-identity switch.
//!
//! Every filesystem operation the object store performs against a bucket's
//! backing directory runs under that bucket owner's (uid, gid), via Linux's
//! per-thread `fsuid`/`fsgid`. Grounded on
//! `examples/original_source/src/XrdS3/XrdS3ScopedFsId.hh`.
//!
//! `setfsuid`/`setfsgid` are per-thread, not per-process, which is exactly
//! what we want: `tokio::task::spawn_blocking` runs each call on its own
//! blocking-pool thread, so concurrent requests for different buckets never
//! clobber each other's identity.

#[cfg(target_os = "linux")]
mod imp {
    /// RAII guard: switches the calling thread's fsuid/fsgid for its lifetime.
    pub struct ScopedFsId {
        prev_uid: i32,
        prev_gid: i32,
        ok: bool,
    }

    impl ScopedFsId {
        pub fn new(uid: u32, gid: u32) -> Self {
            // SAFETY: setfsuid/setfsgid are simple syscalls with no invariants
            // beyond "valid uid/gid", which callers guarantee via Owner resolution.
            let prev_uid = unsafe { libc::setfsuid(uid as libc::uid_t) };
            let now_uid = unsafe { libc::setfsuid(uid as libc::uid_t) };
            let prev_gid = unsafe { libc::setfsgid(gid as libc::gid_t) };
            let now_gid = unsafe { libc::setfsgid(gid as libc::gid_t) };
            let ok = now_uid == uid as i32 && now_gid == gid as i32;
            Self {
                prev_uid,
                prev_gid,
                ok,
            }
        }

        pub fn is_ok(&self) -> bool {
            self.ok
        }

        /// Called once at startup: verifies the process holds CAP_SETUID (or
        /// runs as root) before accepting any request that would depend on it.
        pub fn validate() -> bool {
            let euid = unsafe { libc::geteuid() };
            let probe = Self::new(euid, unsafe { libc::getegid() });
            probe.is_ok()
        }
    }

    impl Drop for ScopedFsId {
        fn drop(&mut self) {
            unsafe {
                libc::setfsuid(self.prev_uid as libc::uid_t);
                libc::setfsgid(self.prev_gid as libc::gid_t);
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    /// Non-Linux builds have no per-thread fsuid/fsgid; identity switching is a no-op.
    pub struct ScopedFsId;

    impl ScopedFsId {
        pub fn new(_uid: u32, _gid: u32) -> Self {
            Self
        }

        pub fn is_ok(&self) -> bool {
            true
        }

        pub fn validate() -> bool {
            true
        }
    }
}

pub use imp::ScopedFsId;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_fsid_is_constructible() {
        let euid = unsafe { libc::geteuid() } as u32;
        let egid = unsafe { libc::getegid() } as u32;
        let guard = ScopedFsId::new(euid, egid);
        drop(guard);
    }
}
