//! SFTP delivery over ssh2. Key-file authentication first, password from the
//! recipient URL as fallback.

use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use crate::DeliveryError;
use crate::ruledb::Recipient;
use crate::state::fsa::HostEntry;

use super::DeliveryClient;

pub struct SftpClient {
    addr: String,
    user: String,
    password: Option<String>,
    timeout: Duration,
    sess: Option<ssh2::Session>,
    sftp: Option<ssh2::Sftp>,
    cwd: PathBuf,
    open: Option<(PathBuf, ssh2::File)>,
}

impl SftpClient {
    pub fn new(recipient: &Recipient, host: &HostEntry, timeout_secs: i64) -> SftpClient {
        // the FSA record owns the real hostname (A/B toggling); the URL path
        // and credentials come from the recipient
        let real = host.current_real_hostname();
        let hostname = if real.is_empty() { recipient.host.clone() } else { real.to_string() };
        let port = if host.port > 0 { host.port as u16 } else { recipient.port };
        SftpClient {
            addr: format!("{}:{}", hostname, port),
            user: recipient.user.clone(),
            password: recipient.password.clone(),
            timeout: Duration::from_secs(timeout_secs.max(1) as u64),
            sess: None,
            sftp: None,
            cwd: PathBuf::from("."),
            open: None,
        }
    }

    fn target(&self, name: &str) -> PathBuf {
        self.cwd.join(name)
    }

    fn sftp(&self) -> Result<&ssh2::Sftp, DeliveryError> {
        self.sftp
            .as_ref()
            .ok_or_else(|| DeliveryError::Connect(format!("SFTP 未建立: {}", self.addr)))
    }
}

/// TCP + handshake + auth, shared by the sftp and scp clients.
pub(super) fn connect_session(
    addr: &str,
    user: &str,
    password: Option<&str>,
    timeout: Duration,
) -> Result<ssh2::Session, DeliveryError> {
    let mut addrs = addr
        .to_socket_addrs()
        .map_err(|e| DeliveryError::Connect(format!("{}: {}", addr, e)))?;
    let sock = addrs
        .next()
        .ok_or_else(|| DeliveryError::Connect(format!("无法解析地址: {}", addr)))?;
    let tcp = TcpStream::connect_timeout(&sock, Duration::from_secs(10))
        .map_err(|e| DeliveryError::Connect(format!("{}: {}", addr, e)))?;
    let _ = tcp.set_read_timeout(Some(timeout));
    let _ = tcp.set_write_timeout(Some(timeout));
    let mut sess = ssh2::Session::new()
        .map_err(|_| DeliveryError::Connect(format!("无法创建 SSH Session: {}", addr)))?;
    sess.set_tcp_stream(tcp);
    sess.handshake()
        .map_err(|e| DeliveryError::Connect(format!("SSH 握手失败 {}: {}", addr, e)))?;

    // 密钥认证优先，URL 携带的口令兜底
    if let Some(home) = dirs::home_dir() {
        for name in ["id_ed25519", "id_rsa", "id_ecdsa"] {
            let p = home.join(".ssh").join(name);
            if p.exists() {
                let _ = sess.userauth_pubkey_file(user, None, &p, None);
                if sess.authenticated() {
                    return Ok(sess);
                }
            }
        }
    }
    if let Some(pw) = password {
        let _ = sess.userauth_password(user, pw);
        if sess.authenticated() {
            return Ok(sess);
        }
        return Err(DeliveryError::Password(format!("{}@{}", user, addr)));
    }
    Err(DeliveryError::User(format!("{}@{}", user, addr)))
}

impl DeliveryClient for SftpClient {
    fn connect(&mut self) -> Result<(), DeliveryError> {
        let sess =
            connect_session(&self.addr, &self.user, self.password.as_deref(), self.timeout)?;
        let sftp = sess
            .sftp()
            .map_err(|e| DeliveryError::Connect(format!("创建 SFTP 失败 {}: {}", self.addr, e)))?;
        self.sess = Some(sess);
        self.sftp = Some(sftp);
        Ok(())
    }

    fn change_dir(&mut self, dir: &str) -> Result<(), DeliveryError> {
        let dir = if dir.starts_with('~') {
            let sess = self
                .sess
                .as_ref()
                .ok_or_else(|| DeliveryError::Chdir("会话未建立".to_string()))?;
            expand_remote_tilde(sess, dir)?
        } else {
            dir.to_string()
        };
        let path = if dir.is_empty() { PathBuf::from(".") } else { PathBuf::from(dir) };
        let sftp = self.sftp()?;
        match sftp.stat(&path) {
            Ok(st) if !st.is_file() => {}
            Ok(_) => {
                return Err(DeliveryError::Chdir(format!("目标不是目录: {}", path.display())));
            }
            Err(_) => {
                // one-level mkdir only; missing parents stay an error
                sftp.mkdir(&path, 0o755)
                    .map_err(|e| DeliveryError::Chdir(format!("{}: {}", path.display(), e)))?;
            }
        }
        self.cwd = path;
        Ok(())
    }

    fn open_remote(&mut self, name: &str) -> Result<(), DeliveryError> {
        let path = self.target(name);
        let f = self
            .sftp()?
            .create(&path)
            .map_err(|e| DeliveryError::OpenRemote(format!("{}: {}", path.display(), e)))?;
        self.open = Some((path, f));
        Ok(())
    }

    fn write_block(&mut self, buf: &[u8]) -> Result<(), DeliveryError> {
        let Some((ref path, ref mut f)) = self.open else {
            return Err(DeliveryError::WriteRemote("没有打开的远端文件".to_string()));
        };
        f.write_all(buf)
            .map_err(|e| DeliveryError::WriteRemote(format!("{}: {}", path.display(), e)))
    }

    fn close_remote(&mut self) -> Result<(), DeliveryError> {
        if let Some((path, mut f)) = self.open.take() {
            f.flush()
                .map_err(|e| DeliveryError::CloseRemote(format!("{}: {}", path.display(), e)))?;
        }
        Ok(())
    }

    fn rename_remote(&mut self, from: &str, to: &str) -> Result<(), DeliveryError> {
        let (src, dst) = (self.target(from), self.target(to));
        self.sftp()?
            .rename(&src, &dst, Some(ssh2::RenameFlags::OVERWRITE))
            .map_err(|e| DeliveryError::Rename(format!("{} -> {}: {}", from, to, e)))
    }

    fn chmod_remote(&mut self, name: &str, mode: u32) -> Result<(), DeliveryError> {
        let path = self.target(name);
        let stat = ssh2::FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: Some(mode),
            atime: None,
            mtime: None,
        };
        self.sftp()?
            .setstat(&path, stat)
            .map_err(|e| DeliveryError::Move(format!("chmod {}: {}", path.display(), e)))
    }

    fn delete_remote(&mut self, name: &str) -> Result<(), DeliveryError> {
        let path = self.target(name);
        self.sftp()?
            .unlink(&path)
            .map_err(|e| DeliveryError::Move(format!("unlink {}: {}", path.display(), e)))
    }

    fn disconnect(&mut self) {
        self.open = None;
        self.sftp = None;
        if let Some(sess) = self.sess.take() {
            let _ = sess.disconnect(None, "done", None);
        }
    }
}

/// Expand a leading `~` against the remote home directory.
pub(super) fn expand_remote_tilde(
    sess: &ssh2::Session,
    path: &str,
) -> Result<String, DeliveryError> {
    use std::io::Read;
    if !path.starts_with('~') {
        return Ok(path.to_string());
    }
    let mut channel = sess
        .channel_session()
        .map_err(|e| DeliveryError::Chdir(format!("channel: {}", e)))?;
    let _ = channel.exec("printf '%s' \"$HOME\" || echo '~'");
    let mut s = String::new();
    channel.read_to_string(&mut s).ok();
    channel.wait_close().ok();
    let home = s.lines().next().unwrap_or("~").trim().to_string();
    let tail = path.trim_start_matches('~').trim_start_matches('/');
    Ok(if tail.is_empty() {
        home
    } else {
        format!("{}/{}", home.trim_end_matches('/'), tail)
    })
}
