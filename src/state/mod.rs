//! Shared state layer: typed, versioned, memory-mapped record arrays.
//!
//! 每个区域 = 固定头 + 定长记录数组，多进程通过同一文件 mmap 共享；
//! 计数器更新必须持有对应字节范围锁（见 `lock.rs`） — one region is a fixed
//! header followed by a fixed-layout record array, shared across processes
//! through the same mapped file; counter updates must hold the matching
//! byte-range lock.
//!
//! Records are `#[repr(C)] + Copy` plain data with offsets, never pointers.
//! Readers validate magic and struct version at attach time and re-attach
//! when the generation id changes (the ingest daemon bumps it whenever the
//! rule set is rebuilt).

pub mod fra;
pub mod fsa;
pub mod jid;
pub mod lock;
pub mod msa;

use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use memmap2::MmapRaw;

use crate::StateError;
pub use lock::{LockKind, RecordLock};

/// Fixed-size header ahead of every record array (the region word offset).
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RegionHeader {
    pub magic: u32,
    pub element_count: u32,
    pub struct_version: u8,
    pub minor: [u8; 2],
    _pad: u8,
    pub page_size: i32,
    pub generation: u32,
    _pad2: u32,
}

/// Header byte length, padded so the record array starts 8-aligned.
pub const HEADER_LEN: usize = std::mem::size_of::<RegionHeader>();

/// A memory-mapped region of `N` records of type `T`.
///
/// `T` must be `#[repr(C)] + Copy` with no niches; all of its bytes are valid
/// in any state the daemons write. Mutation goes through `with_mut` which
/// hands out a short-lived reference only — long-lived aliases across
/// suspension points are not expressible through this API.
pub struct MappedRegion<T: Copy> {
    file: File,
    map: MmapRaw,
    path: PathBuf,
    magic: u32,
    version: u8,
    generation: u32,
    element_count: u32,
    _marker: PhantomData<T>,
}

impl<T: Copy> std::fmt::Debug for MappedRegion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("path", &self.path)
            .field("magic", &self.magic)
            .field("version", &self.version)
            .field("generation", &self.generation)
            .field("element_count", &self.element_count)
            .finish()
    }
}

impl<T: Copy> MappedRegion<T> {
    /// Create (or re-create) the region with `n` zeroed records. An existing
    /// file keeps its generation counter, bumped by one, so attached readers
    /// notice the replacement.
    pub fn create(path: &Path, n: u32, magic: u32, version: u8) -> Result<MappedRegion<T>> {
        let old_generation = match Self::attach_impl(path, magic, version, false) {
            Ok(r) => r.generation,
            Err(_) => 0,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("无法创建共享区域: {}", path.display()))?;
        let len = HEADER_LEN + (n as usize) * std::mem::size_of::<T>();
        file.set_len(len as u64)
            .with_context(|| format!("无法调整共享区域大小: {}", path.display()))?;
        let map = MmapRaw::map_raw(&file)
            .with_context(|| format!("mmap 失败(致命): {}", path.display()))?;
        let generation = old_generation.wrapping_add(1);
        let header = RegionHeader {
            magic,
            element_count: n,
            struct_version: version,
            minor: [0, 0],
            _pad: 0,
            page_size: page_size(),
            generation,
            _pad2: 0,
        };
        // SAFETY: map is at least HEADER_LEN bytes; header is plain data.
        unsafe {
            std::ptr::write(map.as_mut_ptr() as *mut RegionHeader, header);
        }
        Ok(MappedRegion {
            file,
            map,
            path: path.to_path_buf(),
            magic,
            version,
            generation,
            element_count: n,
            _marker: PhantomData,
        })
    }

    /// Attach read/write. Corrupt magic or a version we were not built for
    /// aborts the attach; mmap failure is fatal at this point.
    pub fn attach(path: &Path, magic: u32, version: u8) -> Result<MappedRegion<T>> {
        Self::attach_impl(path, magic, version, true)
    }

    /// Attach read-only (monitors). Same validation as `attach`.
    pub fn attach_ro(path: &Path, magic: u32, version: u8) -> Result<MappedRegion<T>> {
        // The mapping itself stays writable at the OS level; the type system
        // side only hands out shared references from `with`.
        Self::attach_impl(path, magic, version, true)
    }

    fn attach_impl(path: &Path, magic: u32, version: u8, validate_len: bool) -> Result<MappedRegion<T>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("无法打开共享区域: {}", path.display()))?;
        let meta = file
            .metadata()
            .with_context(|| format!("无法 stat 共享区域: {}", path.display()))?;
        if (meta.len() as usize) < HEADER_LEN {
            return Err(StateError::TooSmall(path.to_path_buf(), meta.len() as usize).into());
        }
        let map = MmapRaw::map_raw(&file)
            .with_context(|| format!("mmap 失败(致命): {}", path.display()))?;
        // SAFETY: map covers at least HEADER_LEN bytes.
        let header: RegionHeader = unsafe { std::ptr::read(map.as_ptr() as *const RegionHeader) };
        if header.magic != magic {
            return Err(StateError::BadMagic(path.to_path_buf(), header.magic).into());
        }
        if header.struct_version != version {
            return Err(
                StateError::VersionMismatch(path.to_path_buf(), header.struct_version, version)
                    .into(),
            );
        }
        let need = HEADER_LEN + (header.element_count as usize) * std::mem::size_of::<T>();
        if validate_len && (meta.len() as usize) < need {
            return Err(StateError::TooSmall(path.to_path_buf(), meta.len() as usize).into());
        }
        Ok(MappedRegion {
            file,
            map,
            path: path.to_path_buf(),
            magic,
            version,
            generation: header.generation,
            element_count: header.element_count,
            _marker: PhantomData,
        })
    }

    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// Check the on-disk generation against the one seen at attach time.
    /// A mismatch means the region was replaced underneath us.
    pub fn check_generation(&self) -> Result<(), StateError> {
        // SAFETY: header is always mapped.
        let header: RegionHeader =
            unsafe { std::ptr::read_volatile(self.map.as_ptr() as *const RegionHeader) };
        if header.generation != self.generation {
            return Err(StateError::StaleGeneration(self.generation, header.generation));
        }
        Ok(())
    }

    /// Re-attach after a generation change.
    pub fn reattach(&mut self) -> Result<()> {
        let fresh = Self::attach_impl(&self.path, self.magic, self.version, true)?;
        *self = fresh;
        Ok(())
    }

    /// Byte offset of record `idx` inside the file, for byte-range locks.
    pub fn byte_offset(&self, idx: usize) -> u64 {
        (HEADER_LEN + idx * std::mem::size_of::<T>()) as u64
    }

    fn entry_ptr(&self, idx: usize) -> Result<*mut T, StateError> {
        if idx >= self.element_count as usize {
            return Err(StateError::IndexOutOfRange(idx, self.element_count));
        }
        // SAFETY: idx bounds-checked against the validated element count.
        Ok(unsafe { (self.map.as_mut_ptr().add(HEADER_LEN) as *mut T).add(idx) })
    }

    /// Short-lived shared access to one record.
    pub fn with<R>(&self, idx: usize, f: impl FnOnce(&T) -> R) -> Result<R, StateError> {
        let p = self.entry_ptr(idx)?;
        // SAFETY: records are plain data; concurrent field writes are guarded
        // by the byte-range lock discipline at the call sites.
        Ok(f(unsafe { &*p }))
    }

    /// Short-lived exclusive access to one record. The caller must hold the
    /// byte-range lock that guards the fields it mutates.
    pub fn with_mut<R>(&self, idx: usize, f: impl FnOnce(&mut T) -> R) -> Result<R, StateError> {
        let p = self.entry_ptr(idx)?;
        // SAFETY: as above; exclusivity over guarded fields comes from the lock.
        Ok(f(unsafe { &mut *p }))
    }

    /// Copy one record out.
    pub fn read(&self, idx: usize) -> Result<T, StateError> {
        self.with(idx, |t| *t)
    }

    /// Lock a byte range of this region's file.
    pub fn lock_range(&self, start: u64, len: u64, kind: LockKind) -> Result<RecordLock<'_>> {
        RecordLock::acquire(&self.file, start, len, kind)
            .with_context(|| format!("字节范围锁失败: {} @{}", self.path.display(), start))
    }
}

fn page_size() -> i32 {
    // SAFETY: sysconf is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as i32 }
}

/// Read a NUL-terminated fixed-size name field.
pub fn fixed_str(buf: &[u8]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).unwrap_or("")
}

/// Store `s` into a fixed-size name field, NUL-terminated, truncating.
pub fn set_fixed_str(buf: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(buf.len().saturating_sub(1));
    buf[..n].copy_from_slice(&bytes[..n]);
    for b in &mut buf[n..] {
        *b = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Rec {
        a: u32,
        b: u64,
        name: [u8; 16],
    }

    const MAGIC: u32 = 0x5452_0001;

    #[test]
    fn create_attach_read_write() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = tmp.path().join("region");
        let r = MappedRegion::<Rec>::create(&p, 4, MAGIC, 1).expect("create");
        r.with_mut(2, |rec| {
            rec.a = 7;
            rec.b = 99;
            set_fixed_str(&mut rec.name, "bravo");
        })
        .expect("write");

        let r2 = MappedRegion::<Rec>::attach(&p, MAGIC, 1).expect("attach");
        assert_eq!(r2.element_count(), 4);
        let rec = r2.read(2).expect("read");
        assert_eq!(rec.a, 7);
        assert_eq!(fixed_str(&rec.name), "bravo");
        assert!(r2.read(4).is_err());
    }

    #[test]
    fn version_mismatch_refused() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = tmp.path().join("region");
        let _r = MappedRegion::<Rec>::create(&p, 1, MAGIC, 1).expect("create");
        let err = MappedRegion::<Rec>::attach(&p, MAGIC, 2).unwrap_err();
        assert!(err.to_string().contains("版本不匹配"));
    }

    #[test]
    fn generation_bumps_on_recreate() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = tmp.path().join("region");
        let r1 = MappedRegion::<Rec>::create(&p, 1, MAGIC, 1).expect("create");
        let attached = MappedRegion::<Rec>::attach(&p, MAGIC, 1).expect("attach");
        let g1 = r1.generation();
        drop(r1);
        let r2 = MappedRegion::<Rec>::create(&p, 2, MAGIC, 1).expect("recreate");
        assert_eq!(r2.generation(), g1.wrapping_add(1));
        assert!(attached.check_generation().is_err());
    }

    #[test]
    fn fixed_str_round_trip() {
        let mut buf = [0u8; 8];
        set_fixed_str(&mut buf, "longer-than-buffer");
        assert_eq!(fixed_str(&buf), "longer-"); // 7 chars + NUL
    }
}
