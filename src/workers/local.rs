//! Local filesystem delivery: the degenerate client used for same-machine
//! destinations and throughout the test suite.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use crate::DeliveryError;
use crate::ruledb::Recipient;

use super::DeliveryClient;

pub struct LocalClient {
    base: PathBuf,
    cwd: PathBuf,
    open: Option<(PathBuf, File)>,
}

impl LocalClient {
    pub fn new(recipient: &Recipient) -> LocalClient {
        let base = PathBuf::from(&recipient.path);
        LocalClient { cwd: base.clone(), base, open: None }
    }

    fn target(&self, name: &str) -> PathBuf {
        self.cwd.join(name)
    }
}

impl DeliveryClient for LocalClient {
    fn connect(&mut self) -> Result<(), DeliveryError> {
        // nothing to connect; the base directory must be creatable
        std::fs::create_dir_all(&self.base)
            .map_err(|e| DeliveryError::Connect(format!("{}: {}", self.base.display(), e)))?;
        Ok(())
    }

    fn change_dir(&mut self, dir: &str) -> Result<(), DeliveryError> {
        // the recipient path IS the working dir; a non-empty dir argument
        // selects a subdirectory below it
        let target = if dir.is_empty() || dir == self.base.to_string_lossy() {
            self.base.clone()
        } else if std::path::Path::new(dir).is_absolute() {
            PathBuf::from(dir)
        } else {
            self.base.join(dir)
        };
        std::fs::create_dir_all(&target)
            .map_err(|e| DeliveryError::Chdir(format!("{}: {}", target.display(), e)))?;
        self.cwd = target;
        Ok(())
    }

    fn open_remote(&mut self, name: &str) -> Result<(), DeliveryError> {
        let path = self.target(name);
        let f = File::create(&path)
            .map_err(|e| DeliveryError::OpenRemote(format!("{}: {}", path.display(), e)))?;
        self.open = Some((path, f));
        Ok(())
    }

    fn write_block(&mut self, buf: &[u8]) -> Result<(), DeliveryError> {
        let Some((ref path, ref mut f)) = self.open else {
            return Err(DeliveryError::WriteRemote("没有打开的目标文件".to_string()));
        };
        f.write_all(buf)
            .map_err(|e| DeliveryError::WriteRemote(format!("{}: {}", path.display(), e)))
    }

    fn close_remote(&mut self) -> Result<(), DeliveryError> {
        if let Some((path, f)) = self.open.take() {
            f.sync_all()
                .map_err(|e| DeliveryError::CloseRemote(format!("{}: {}", path.display(), e)))?;
        }
        Ok(())
    }

    fn rename_remote(&mut self, from: &str, to: &str) -> Result<(), DeliveryError> {
        std::fs::rename(self.target(from), self.target(to))
            .map_err(|e| DeliveryError::Rename(format!("{} -> {}: {}", from, to, e)))
    }

    fn chmod_remote(&mut self, name: &str, mode: u32) -> Result<(), DeliveryError> {
        use std::os::unix::fs::PermissionsExt;
        let path = self.target(name);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| DeliveryError::Move(format!("chmod {}: {}", path.display(), e)))
    }

    fn delete_remote(&mut self, name: &str) -> Result<(), DeliveryError> {
        let path = self.target(name);
        std::fs::remove_file(&path)
            .map_err(|e| DeliveryError::Move(format!("unlink {}: {}", path.display(), e)))
    }

    fn disconnect(&mut self) {
        self.open = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ruledb::Scheme;

    fn recipient(path: &str) -> Recipient {
        Recipient {
            scheme: Scheme::Local,
            user: String::new(),
            password: None,
            host: String::new(),
            port: 0,
            path: path.to_string(),
        }
    }

    #[test]
    fn full_delivery_cycle() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let out = tmp.path().join("out");
        let mut c = LocalClient::new(&recipient(&out.to_string_lossy()));
        c.connect().expect("connect");
        c.change_dir("").expect("cd");
        c.open_remote(".a.bin").expect("open");
        c.write_block(b"hello ").expect("write");
        c.write_block(b"world").expect("write");
        c.close_remote().expect("close");
        c.rename_remote(".a.bin", "a.bin").expect("rename");
        assert_eq!(std::fs::read(out.join("a.bin")).unwrap(), b"hello world");
        c.delete_remote("a.bin").expect("delete");
        assert!(!out.join("a.bin").exists());
    }

    #[test]
    fn write_without_open_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut c = LocalClient::new(&recipient(&tmp.path().to_string_lossy()));
        assert!(matches!(c.write_block(b"x"), Err(DeliveryError::WriteRemote(_))));
    }
}
