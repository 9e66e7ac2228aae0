//! SCP delivery over ssh2. The scp wire protocol needs the size before the
//! data, so blocks are buffered per file and flushed in `close_remote`;
//! rename/chmod/delete run as remote commands on the same session.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use crate::DeliveryError;
use crate::ruledb::Recipient;
use crate::state::fsa::HostEntry;

use super::DeliveryClient;
use super::sftp::connect_session;

pub struct ScpClient {
    addr: String,
    user: String,
    password: Option<String>,
    timeout: Duration,
    sess: Option<ssh2::Session>,
    cwd: PathBuf,
    pending: Option<(String, Vec<u8>)>,
    mode: u32,
}

impl ScpClient {
    pub fn new(recipient: &Recipient, host: &HostEntry, timeout_secs: i64) -> ScpClient {
        let real = host.current_real_hostname();
        let hostname = if real.is_empty() { recipient.host.clone() } else { real.to_string() };
        let port = if host.port > 0 { host.port as u16 } else { recipient.port };
        ScpClient {
            addr: format!("{}:{}", hostname, port),
            user: recipient.user.clone(),
            password: recipient.password.clone(),
            timeout: Duration::from_secs(timeout_secs.max(1) as u64),
            sess: None,
            cwd: PathBuf::from("."),
            pending: None,
            mode: 0o644,
        }
    }

    fn sess(&self) -> Result<&ssh2::Session, DeliveryError> {
        self.sess
            .as_ref()
            .ok_or_else(|| DeliveryError::Connect(format!("SSH 未建立: {}", self.addr)))
    }

    fn run_remote(&self, cmd: &str) -> Result<(), DeliveryError> {
        let sess = self.sess()?;
        let mut channel = sess
            .channel_session()
            .map_err(|e| DeliveryError::WriteRemote(format!("channel: {}", e)))?;
        channel
            .exec(cmd)
            .map_err(|e| DeliveryError::WriteRemote(format!("exec '{}': {}", cmd, e)))?;
        let mut out = String::new();
        channel.read_to_string(&mut out).ok();
        channel.wait_close().ok();
        match channel.exit_status() {
            Ok(0) => Ok(()),
            Ok(code) => {
                Err(DeliveryError::WriteRemote(format!("'{}' 退出码 {}: {}", cmd, code, out)))
            }
            Err(e) => Err(DeliveryError::WriteRemote(format!("'{}': {}", cmd, e))),
        }
    }

    fn quoted(&self, name: &str) -> String {
        format!("'{}'", self.cwd.join(name).to_string_lossy().replace('\'', "'\\''"))
    }
}

impl DeliveryClient for ScpClient {
    fn connect(&mut self) -> Result<(), DeliveryError> {
        let sess =
            connect_session(&self.addr, &self.user, self.password.as_deref(), self.timeout)?;
        self.sess = Some(sess);
        Ok(())
    }

    fn change_dir(&mut self, dir: &str) -> Result<(), DeliveryError> {
        self.cwd = if dir.is_empty() { PathBuf::from(".") } else { PathBuf::from(dir) };
        self.run_remote(&format!("mkdir -p {}", self.quoted("")))
            .map_err(|e| DeliveryError::Chdir(e.to_string()))
    }

    fn open_remote(&mut self, name: &str) -> Result<(), DeliveryError> {
        if self.pending.is_some() {
            return Err(DeliveryError::OpenRemote("上一个文件尚未关闭".to_string()));
        }
        self.pending = Some((name.to_string(), Vec::new()));
        Ok(())
    }

    fn write_block(&mut self, buf: &[u8]) -> Result<(), DeliveryError> {
        let Some((_, ref mut data)) = self.pending else {
            return Err(DeliveryError::WriteRemote("没有打开的远端文件".to_string()));
        };
        data.extend_from_slice(buf);
        Ok(())
    }

    fn close_remote(&mut self) -> Result<(), DeliveryError> {
        let Some((name, data)) = self.pending.take() else {
            return Ok(());
        };
        let path = self.cwd.join(&name);
        let sess = self.sess()?;
        let mut ch = sess
            .scp_send(&path, self.mode as i32, data.len() as u64, None)
            .map_err(|e| DeliveryError::OpenRemote(format!("{}: {}", path.display(), e)))?;
        ch.write_all(&data)
            .map_err(|e| DeliveryError::WriteRemote(format!("{}: {}", path.display(), e)))?;
        ch.send_eof()
            .and_then(|_| ch.wait_eof())
            .and_then(|_| ch.close())
            .and_then(|_| ch.wait_close())
            .map_err(|e| DeliveryError::CloseRemote(format!("{}: {}", path.display(), e)))?;
        Ok(())
    }

    fn rename_remote(&mut self, from: &str, to: &str) -> Result<(), DeliveryError> {
        self.run_remote(&format!("mv {} {}", self.quoted(from), self.quoted(to)))
            .map_err(|e| DeliveryError::Rename(e.to_string()))
    }

    fn chmod_remote(&mut self, name: &str, mode: u32) -> Result<(), DeliveryError> {
        self.mode = mode;
        self.run_remote(&format!("chmod {:o} {}", mode, self.quoted(name)))
            .map_err(|e| DeliveryError::Move(e.to_string()))
    }

    fn delete_remote(&mut self, name: &str) -> Result<(), DeliveryError> {
        self.run_remote(&format!("rm -f {}", self.quoted(name)))
            .map_err(|e| DeliveryError::Move(e.to_string()))
    }

    fn disconnect(&mut self) {
        self.pending = None;
        if let Some(sess) = self.sess.take() {
            let _ = sess.disconnect(None, "done", None);
        }
    }
}
