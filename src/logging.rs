//! Log fan-outs: the binary output log plus the input and delete logs.
//! System/transfer logging goes through `tracing` (initialised in main);
//! the writers here are the fixed-layout records log consumers parse.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};

// output_type values
pub const OT_NORMAL_DELIVERED: u8 = 0;
pub const OT_AGE_LIMIT_DELETE: u8 = 1;
pub const OT_DUP_DELETE: u8 = 2;

// delete-log reason codes
pub const DR_AGE_OUTPUT: &str = "AGE_OUTPUT";
pub const DR_AGE_INPUT: &str = "AGE_INPUT";
pub const DR_DUP_INPUT: &str = "DUP_INPUT";
pub const DR_DUP_OUTPUT: &str = "DUP_OUTPUT";
pub const DR_DEL_UNKNOWN_FILE: &str = "DEL_UNKNOWN_FILE";
pub const DR_DEL_QUEUED_FILE: &str = "DEL_QUEUED_FILE";
pub const DR_DEL_OLD_LOCKED_FILE: &str = "DEL_OLD_LOCKED_FILE";
pub const DR_RECOVERY_ORPHAN: &str = "RECOVERY_ORPHAN";

/// One output-log record, written on successful delivery and on age-limit
/// deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRecord {
    pub file_name: String,
    pub archive_path: Option<String>,
    pub unique_name: String,
    pub file_size: u32,
    pub job_id: u32,
    pub retries: u32,
    pub transfer_clocks: u32,
    pub output_type: u8,
}

impl OutputRecord {
    /// Serialise to the wire form:
    /// `file_name \0 [archive_path \0] unique_name u32 file_size u32 job_id
    /// u32 retries u32 transfer_clocks u16 unique_name_length
    /// u16 file_name_length u16 archive_length u8 output_type`.
    ///
    /// Multi-byte fields are native-endian; log consumers run on the same
    /// host as the writer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            self.file_name.len() + self.unique_name.len() + 64,
        );
        out.extend_from_slice(self.file_name.as_bytes());
        out.push(0);
        if let Some(ref a) = self.archive_path {
            out.extend_from_slice(a.as_bytes());
            out.push(0);
        }
        out.extend_from_slice(self.unique_name.as_bytes());
        out.extend_from_slice(&self.file_size.to_ne_bytes());
        out.extend_from_slice(&self.job_id.to_ne_bytes());
        out.extend_from_slice(&self.retries.to_ne_bytes());
        out.extend_from_slice(&self.transfer_clocks.to_ne_bytes());
        out.extend_from_slice(&(self.unique_name.len() as u16).to_ne_bytes());
        out.extend_from_slice(&(self.file_name.len() as u16).to_ne_bytes());
        let archive_len = self.archive_path.as_ref().map(|a| a.len() as u16).unwrap_or(0);
        out.extend_from_slice(&archive_len.to_ne_bytes());
        out.push(self.output_type);
        out
    }

    /// Parse one record. Lengths live in the trailer, so decoding walks the
    /// buffer from its end.
    pub fn decode(buf: &[u8]) -> Result<OutputRecord> {
        const TRAILER: usize = 4 * 4 + 3 * 2 + 1;
        if buf.len() < TRAILER {
            return Err(anyhow::anyhow!("输出日志记录过短: {} 字节", buf.len()));
        }
        let n = buf.len();
        let u16_at = |at: usize| u16::from_ne_bytes([buf[at], buf[at + 1]]);
        let u32_at =
            |at: usize| u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let output_type = buf[n - 1];
        let archive_length = u16_at(n - 3) as usize;
        let file_name_length = u16_at(n - 5) as usize;
        let unique_name_length = u16_at(n - 7) as usize;
        let transfer_clocks = u32_at(n - 11);
        let retries = u32_at(n - 15);
        let job_id = u32_at(n - 19);
        let file_size = u32_at(n - 23);
        let mut expect = file_name_length + 1 + unique_name_length + TRAILER;
        if archive_length > 0 {
            expect += archive_length + 1;
        }
        if buf.len() != expect {
            return Err(anyhow::anyhow!(
                "输出日志记录长度不符: {} != {}",
                buf.len(),
                expect
            ));
        }
        let file_name = std::str::from_utf8(&buf[..file_name_length])
            .context("输出日志文件名不是 UTF-8")?
            .to_string();
        let mut pos = file_name_length + 1;
        let archive_path = if archive_length > 0 {
            let a = std::str::from_utf8(&buf[pos..pos + archive_length])
                .context("输出日志归档路径不是 UTF-8")?
                .to_string();
            pos += archive_length + 1;
            Some(a)
        } else {
            None
        };
        let unique_name = std::str::from_utf8(&buf[pos..pos + unique_name_length])
            .context("输出日志 unique_name 不是 UTF-8")?
            .to_string();
        Ok(OutputRecord {
            file_name,
            archive_path,
            unique_name,
            file_size,
            job_id,
            retries,
            transfer_clocks,
            output_type,
        })
    }
}

/// Appends length-framed output records (`u32 len` + record) so consumers
/// can stream the file forward.
pub struct OutputLog {
    file: Mutex<File>,
}

impl OutputLog {
    pub fn open(dir: &Path) -> Result<OutputLog> {
        let path = dir.join("OUTPUT_LOG");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("无法打开输出日志: {}", path.display()))?;
        Ok(OutputLog { file: Mutex::new(file) })
    }

    pub fn write_record(&self, rec: &OutputRecord) -> Result<()> {
        let body = rec.encode();
        // one write per record: workers in other processes append here too
        let mut framed = Vec::with_capacity(4 + body.len());
        framed.extend_from_slice(&(body.len() as u32).to_ne_bytes());
        framed.extend_from_slice(&body);
        let mut f = self.file.lock().expect("output log poisoned");
        f.write_all(&framed)?;
        f.flush()?;
        Ok(())
    }
}

/// Read back every record of a framed output log (inspection and tests).
pub fn read_output_log(path: &Path) -> Result<Vec<OutputRecord>> {
    let data =
        std::fs::read(path).with_context(|| format!("读取输出日志失败: {}", path.display()))?;
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos + 4 <= data.len() {
        let len =
            u32::from_ne_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;
        if pos + len > data.len() {
            return Err(anyhow::anyhow!("输出日志尾部截断"));
        }
        out.push(OutputRecord::decode(&data[pos..pos + len])?);
        pos += len;
    }
    Ok(out)
}

/// JSON-lines delete log with classified reasons.
pub struct DeleteLog {
    file: Mutex<File>,
}

impl DeleteLog {
    pub fn open(dir: &Path) -> Result<DeleteLog> {
        let path = dir.join("DELETE_LOG.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("无法打开删除日志: {}", path.display()))?;
        Ok(DeleteLog { file: Mutex::new(file) })
    }

    pub fn write(
        &self,
        reason: &str,
        file_name: &str,
        size: u64,
        scope: u32,
        when: i64,
    ) -> Result<()> {
        let obj = serde_json::json!({
            "reason": reason,
            "file": file_name,
            "size": size,
            "scope": format!("{:x}", scope),
            "time": when,
        });
        let mut f = self.file.lock().expect("delete log poisoned");
        writeln!(f, "{}", obj)?;
        Ok(())
    }
}

/// JSON-lines input log: one line per file the scanner picked up.
pub struct InputLog {
    file: Mutex<File>,
}

impl InputLog {
    pub fn open(dir: &Path) -> Result<InputLog> {
        let path = dir.join("INPUT_LOG.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("无法打开输入日志: {}", path.display()))?;
        Ok(InputLog { file: Mutex::new(file) })
    }

    pub fn write(&self, dir_id: u32, file_name: &str, size: u64, when: i64) -> Result<()> {
        let obj = serde_json::json!({
            "dir": format!("{:x}", dir_id),
            "file": file_name,
            "size": size,
            "time": when,
        });
        let mut f = self.file.lock().expect("input log poisoned");
        writeln!(f, "{}", obj)?;
        Ok(())
    }
}
