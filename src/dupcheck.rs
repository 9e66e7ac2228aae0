//! Duplicate suppression: CRC32 digests scoped by directory id (ingest) or
//! job id (send), expiring after a per-scope timeout.
//!
//! 存储放在嵌入式 SQLite 里（进程内单写连接，插入天然串行化）；同一 key 在
//! 超时窗口内即使原文件已消失也会继续判重。

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

// dup_check_flag bits: mode (exactly one) + action (exactly one)
pub const DC_FILENAME: u32 = 1;
pub const DC_NAME_NO_SUFFIX: u32 = 1 << 1;
pub const DC_CONTENT: u32 = 1 << 2;
pub const DC_NAME_AND_CONTENT: u32 = 1 << 3;
pub const DC_ACTION_WARN: u32 = 1 << 4;
pub const DC_ACTION_DELETE: u32 = 1 << 5;
pub const DC_ACTION_STORE: u32 = 1 << 6;

/// What to do with a detected duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupAction {
    Warn,
    Delete,
    Store,
}

pub fn action_of(flags: u32) -> DupAction {
    if flags & DC_ACTION_DELETE != 0 {
        DupAction::Delete
    } else if flags & DC_ACTION_STORE != 0 {
        DupAction::Store
    } else {
        DupAction::Warn
    }
}

/// Compute the digest for one file under the configured mode. Content modes
/// stream the file through the hasher; name modes never touch the disk.
pub fn compute_crc(path: Option<&Path>, name: &str, flags: u32) -> Result<u32> {
    if flags & DC_FILENAME != 0 {
        return Ok(crc32fast::hash(name.as_bytes()));
    }
    if flags & DC_NAME_NO_SUFFIX != 0 {
        let stem = match name.rfind('.') {
            Some(i) if i > 0 => &name[..i],
            _ => name,
        };
        return Ok(crc32fast::hash(stem.as_bytes()));
    }
    let mut hasher = crc32fast::Hasher::new();
    if flags & DC_NAME_AND_CONTENT != 0 {
        hasher.update(name.as_bytes());
    }
    let path = path.ok_or_else(|| anyhow::anyhow!("内容判重需要文件路径: {}", name))?;
    let mut f = std::fs::File::open(path)
        .with_context(|| format!("判重读取失败: {}", path.display()))?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// The digest store. One connection per process; SQLite serialises inserts.
pub struct DupCheck {
    conn: Connection,
    store_root: PathBuf,
}

impl DupCheck {
    pub fn open(db_path: &Path, store_root: &Path) -> Result<DupCheck> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("无法打开判重库: {}", db_path.display()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS dup_entries (
                scope_id  INTEGER NOT NULL,
                crc       INTEGER NOT NULL,
                expire_at INTEGER NOT NULL,
                PRIMARY KEY (scope_id, crc)
            );
            PRAGMA busy_timeout = 5000;",
        )
        .with_context(|| "初始化判重表失败")?;
        Ok(DupCheck { conn, store_root: store_root.to_path_buf() })
    }

    /// Core check-and-insert. Returns true when the key was already present
    /// and not yet expired; otherwise records it and returns false.
    pub fn check_insert(&self, scope_id: u32, crc: u32, timeout: i64, now: i64) -> Result<bool> {
        let expire: Option<i64> = self
            .conn
            .query_row(
                "SELECT expire_at FROM dup_entries WHERE scope_id = ?1 AND crc = ?2",
                params![scope_id as i64, crc as i64],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| "判重查询失败")?;
        if let Some(expire_at) = expire
            && expire_at > now
        {
            return Ok(true);
        }
        self.conn
            .execute(
                "INSERT OR REPLACE INTO dup_entries (scope_id, crc, expire_at)
                 VALUES (?1, ?2, ?3)",
                params![scope_id as i64, crc as i64, now + timeout],
            )
            .with_context(|| "判重登记失败")?;
        Ok(false)
    }

    /// Convenience form used by the scanner and the workers.
    pub fn isdup(
        &self,
        path: Option<&Path>,
        name: &str,
        scope_id: u32,
        timeout: i64,
        flags: u32,
        now: i64,
    ) -> Result<bool> {
        let crc = compute_crc(path, name, flags)?;
        self.check_insert(scope_id, crc, timeout, now)
    }

    /// Rollback after a failed send: forget the digest so the retry is not
    /// mistaken for a duplicate.
    pub fn remove(&self, scope_id: u32, crc: u32) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM dup_entries WHERE scope_id = ?1 AND crc = ?2",
                params![scope_id as i64, crc as i64],
            )
            .with_context(|| "判重回滚失败")?;
        Ok(())
    }

    /// Drop expired rows. Called opportunistically by the daemons.
    pub fn purge_expired(&self, now: i64) -> Result<usize> {
        let n = self
            .conn
            .execute("DELETE FROM dup_entries WHERE expire_at <= ?1", params![now])
            .with_context(|| "判重清理失败")?;
        Ok(n)
    }

    /// Where a stored duplicate lands: `files/store/<scope_id>/<name>`.
    pub fn store_path(&self, scope_id: u32, name: &str) -> PathBuf {
        self.store_root.join(format!("{:x}", scope_id)).join(name)
    }

    /// Apply the configured action to a duplicate file. Returns the path the
    /// file was moved to, when the action was `Store`.
    pub fn apply_action(
        &self,
        flags: u32,
        path: &Path,
        scope_id: u32,
        name: &str,
    ) -> Result<Option<PathBuf>> {
        match action_of(flags) {
            DupAction::Warn => Ok(None),
            DupAction::Delete => {
                std::fs::remove_file(path)
                    .with_context(|| format!("删除重复文件失败: {}", path.display()))?;
                Ok(None)
            }
            DupAction::Store => {
                let dst = self.store_path(scope_id, name);
                if let Some(parent) = dst.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("无法创建判重存储目录: {}", parent.display()))?;
                }
                std::fs::rename(path, &dst)
                    .with_context(|| format!("移动重复文件失败: {}", path.display()))?;
                Ok(Some(dst))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn open_tmp() -> (tempfile::TempDir, DupCheck) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dc = DupCheck::open(&tmp.path().join("dup.db"), &tmp.path().join("store"))
            .expect("open");
        (tmp, dc)
    }

    #[test]
    fn false_then_true_within_timeout() {
        let (_tmp, dc) = open_tmp();
        let first = dc.isdup(None, "a.bin", 10, 60, DC_FILENAME | DC_ACTION_WARN, 1000).unwrap();
        let second = dc.isdup(None, "a.bin", 10, 60, DC_FILENAME | DC_ACTION_WARN, 1005).unwrap();
        assert_eq!((first, second), (false, true));
    }

    #[test]
    fn expired_entry_is_not_a_duplicate() {
        let (_tmp, dc) = open_tmp();
        assert!(!dc.isdup(None, "a.bin", 10, 60, DC_FILENAME, 1000).unwrap());
        assert!(!dc.isdup(None, "a.bin", 10, 60, DC_FILENAME, 1061).unwrap());
    }

    #[test]
    fn scopes_do_not_collide() {
        let (_tmp, dc) = open_tmp();
        assert!(!dc.isdup(None, "a.bin", 10, 60, DC_FILENAME, 1000).unwrap());
        assert!(!dc.isdup(None, "a.bin", 11, 60, DC_FILENAME, 1000).unwrap());
    }

    #[test]
    fn rollback_forgets_the_key() {
        let (_tmp, dc) = open_tmp();
        let crc = compute_crc(None, "a.bin", DC_FILENAME).unwrap();
        assert!(!dc.check_insert(10, crc, 60, 1000).unwrap());
        dc.remove(10, crc).unwrap();
        assert!(!dc.check_insert(10, crc, 60, 1001).unwrap());
    }

    #[test]
    fn content_mode_sees_through_renames() {
        let (tmp, dc) = open_tmp();
        let p1 = tmp.path().join("one.dat");
        let p2 = tmp.path().join("two.dat");
        let mut f = std::fs::File::create(&p1).unwrap();
        f.write_all(b"payload").unwrap();
        drop(f);
        std::fs::copy(&p1, &p2).unwrap();
        assert!(!dc.isdup(Some(&p1), "one.dat", 5, 60, DC_CONTENT, 100).unwrap());
        assert!(dc.isdup(Some(&p2), "two.dat", 5, 60, DC_CONTENT, 101).unwrap());
    }

    #[test]
    fn name_no_suffix_mode() {
        let a = compute_crc(None, "report.txt", DC_NAME_NO_SUFFIX).unwrap();
        let b = compute_crc(None, "report.csv", DC_NAME_NO_SUFFIX).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn store_action_moves_file() {
        let (tmp, dc) = open_tmp();
        let p = tmp.path().join("dup.bin");
        std::fs::write(&p, b"x").unwrap();
        let dst = dc
            .apply_action(DC_FILENAME | DC_ACTION_STORE, &p, 0xab, "dup.bin")
            .unwrap()
            .expect("stored");
        assert!(!p.exists());
        assert!(dst.exists());
        assert!(dst.to_string_lossy().contains("ab"));
    }
}
