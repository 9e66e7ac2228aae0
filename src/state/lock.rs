use std::fs::File;
use std::os::fd::AsRawFd;

/// Advisory byte-range lock kinds. Writers take `Write` on the designated
/// byte of a record before mutating the fields it guards; readers take
/// `Read` on the same byte for a point-in-time consistent view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

/// RAII guard over an fcntl byte-range lock. Unlocks on drop. The guard
/// borrows the region file so it cannot outlive the mapping.
pub struct RecordLock<'a> {
    file: &'a File,
    start: i64,
    len: i64,
}

fn fcntl_lock(file: &File, l_type: libc::c_short, start: i64, len: i64) -> std::io::Result<()> {
    // SAFETY: flock is plain-old-data; zeroed then field-initialised.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = l_type;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = start as libc::off_t;
    fl.l_len = len as libc::off_t;
    // SAFETY: fd is valid for the lifetime of `file`; F_SETLKW blocks until granted.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLKW, &mut fl) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

impl<'a> RecordLock<'a> {
    /// Block until the byte range `[start, start+len)` of `file` is locked.
    pub fn acquire(
        file: &'a File,
        start: u64,
        len: u64,
        kind: LockKind,
    ) -> std::io::Result<RecordLock<'a>> {
        let l_type = match kind {
            LockKind::Read => libc::F_RDLCK,
            LockKind::Write => libc::F_WRLCK,
        } as libc::c_short;
        fcntl_lock(file, l_type, start as i64, len as i64)?;
        Ok(RecordLock { file, start: start as i64, len: len as i64 })
    }
}

impl Drop for RecordLock<'_> {
    fn drop(&mut self) {
        let _ = fcntl_lock(self.file, libc::F_UNLCK as libc::c_short, self.start, self.len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_and_relock_same_process() {
        // fcntl locks are per-process; re-acquiring the same range must not
        // deadlock within one process.
        let tmp = tempfile::NamedTempFile::new().expect("tmp");
        let f = tmp.as_file();
        {
            let _g = RecordLock::acquire(f, 0, 1, LockKind::Write).expect("first");
            let _g2 = RecordLock::acquire(f, 0, 1, LockKind::Write).expect("second");
        }
        let _g3 = RecordLock::acquire(f, 0, 1, LockKind::Read).expect("after drop");
    }
}
