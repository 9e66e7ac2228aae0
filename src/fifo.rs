use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

/// Create a named pipe if it does not exist yet. EEXIST is tolerated so the
/// daemons can race on startup.
pub fn mkfifo_if_missing(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    let c = CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("FIFO 路径包含 NUL: {}", path.display()))?;
    // SAFETY: c is a valid NUL-terminated path for the lifetime of the call.
    let rc = unsafe { libc::mkfifo(c.as_ptr(), 0o600) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EEXIST) {
            return Ok(());
        }
        return Err(err).with_context(|| format!("mkfifo 失败: {}", path.display()));
    }
    Ok(())
}

/// Open a FIFO read+write. O_RDWR on a FIFO never blocks and keeps the read
/// end alive even when no peer is connected yet.
pub fn open_rw(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("无法打开 FIFO: {}", path.display()))
}

/// Open a FIFO read+write in non-blocking mode (used by bounded waits).
pub fn open_rw_nonblock(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .with_context(|| format!("无法打开 FIFO: {}", path.display()))
}

/// Blocking read of a single opcode byte.
pub fn read_opcode(f: &mut File) -> std::io::Result<u8> {
    let mut b = [0u8; 1];
    f.read_exact(&mut b)?;
    Ok(b[0])
}

/// Fire-and-forget write of one opcode byte. The pipe is opened fresh so
/// callers in other processes need no long-lived handle.
pub fn write_opcode(path: &Path, op: u8) -> Result<()> {
    let mut f = open_rw(path)?;
    f.write_all(&[op]).with_context(|| format!("写入 FIFO 失败: {}", path.display()))?;
    Ok(())
}

/// Write a small payload (e.g. a pid) in one shot.
pub fn write_bytes(path: &Path, payload: &[u8]) -> Result<()> {
    let mut f = open_rw(path)?;
    f.write_all(payload).with_context(|| format!("写入 FIFO 失败: {}", path.display()))?;
    Ok(())
}

/// Wait up to `timeout` for one byte to show up on the pipe. Returns Ok(None)
/// on expiry — callers log and continue, never hang on a dead peer.
pub fn await_opcode(path: &Path, timeout: Duration) -> Result<Option<u8>> {
    let mut f = open_rw_nonblock(path)?;
    let deadline = Instant::now() + timeout;
    let mut b = [0u8; 1];
    loop {
        match f.read(&mut b) {
            Ok(1) => return Ok(Some(b[0])),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                return Err(e).with_context(|| format!("读取 FIFO 失败: {}", path.display()));
            }
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
