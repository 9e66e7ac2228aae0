/// Repository-wide structured errors for the distribution pipeline.
///
/// 投递错误按“种类”建模：worker 进程内部用 `DeliveryError` 传递，最外层再映射为
/// 进程退出码 — the exit code is the only contract the dispatcher depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// 无法建立到远端的控制连接
    Connect(String),
    /// 远端拒绝用户名
    User(String),
    /// 远端拒绝口令/密钥
    Password(String),
    /// 切换远端目录失败
    Chdir(String),
    OpenRemote(String),
    ReadRemote(String),
    WriteRemote(String),
    CloseRemote(String),
    /// 远端移动/落盘失败（锁定名 -> 最终名）
    Move(String),
    Rename(String),
    Stat(String),
    WriteLocal(String),
    OpenLocal(String),
    RemoveLockfile(String),
    /// 本地资源分配失败（内存/映射）
    Alloc(String),
    /// 消息名或任务参数不合法
    Syntax(String),
    /// 会话超过传输超时
    Timeout(String),
    ConnectionReset(String),
    /// 消息中的所有文件都因 age-limit 被删除
    AllFilesAgedOut,
    /// 配方 URL 的协议没有内置客户端
    UnsupportedScheme(String),
    /// worker 被信号终止（由上层通过 waitpid 观测）
    GotKilled,
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use DeliveryError::*;
        match self {
            Connect(s) => write!(f, "无法连接远端: {}", s),
            User(s) => write!(f, "远端拒绝用户名: {}", s),
            Password(s) => write!(f, "远端认证失败: {}", s),
            Chdir(s) => write!(f, "切换远端目录失败: {}", s),
            OpenRemote(s) => write!(f, "打开远端文件失败: {}", s),
            ReadRemote(s) => write!(f, "读取远端失败: {}", s),
            WriteRemote(s) => write!(f, "写入远端失败: {}", s),
            CloseRemote(s) => write!(f, "关闭远端文件失败: {}", s),
            Move(s) => write!(f, "远端移动文件失败: {}", s),
            Rename(s) => write!(f, "远端重命名失败: {}", s),
            Stat(s) => write!(f, "stat 失败: {}", s),
            WriteLocal(s) => write!(f, "本地写入失败: {}", s),
            OpenLocal(s) => write!(f, "本地打开失败: {}", s),
            RemoveLockfile(s) => write!(f, "移除锁文件失败: {}", s),
            Alloc(s) => write!(f, "资源分配失败: {}", s),
            Syntax(s) => write!(f, "参数不合法: {}", s),
            Timeout(s) => write!(f, "传输超时: {}", s),
            ConnectionReset(s) => write!(f, "连接被重置: {}", s),
            AllFilesAgedOut => write!(f, "消息内所有文件均已超过 age-limit"),
            UnsupportedScheme(s) => write!(f, "不支持的协议: {}", s),
            GotKilled => write!(f, "worker 被信号终止"),
        }
    }
}

impl std::error::Error for DeliveryError {}

impl DeliveryError {
    /// Whether the dispatcher should put the host back on the queue after
    /// `retry_interval` seconds. Network-shaped failures are retryable;
    /// validation and auth failures are not.
    pub fn is_retryable(&self) -> bool {
        use DeliveryError::*;
        match self {
            Connect(_) | Timeout(_) | ConnectionReset(_) | OpenRemote(_) | ReadRemote(_)
            | WriteRemote(_) | CloseRemote(_) | Move(_) | Rename(_) | Chdir(_) => true,
            // local filesystem trouble is retryable unless the source is gone
            WriteLocal(_) | RemoveLockfile(_) => true,
            User(_) | Password(_) | Syntax(_) | UnsupportedScheme(_) | Alloc(_) => false,
            // missing source: nothing left to retry
            Stat(_) | OpenLocal(_) => false,
            AllFilesAgedOut => false,
            GotKilled => true,
        }
    }

    /// Whether this kind increments the host error counter and enters the
    /// error-history ring. Aged-out messages and kill signals do not count
    /// against the remote end.
    pub fn counts_against_host(&self) -> bool {
        !matches!(self, DeliveryError::AllFilesAgedOut | DeliveryError::GotKilled)
    }

    /// Whether the message should be dropped instead of requeued (the staged
    /// source no longer exists, or the job can never succeed).
    pub fn cancels_message(&self) -> bool {
        use DeliveryError::*;
        matches!(
            self,
            Stat(_) | OpenLocal(_) | Syntax(_) | UnsupportedScheme(_) | AllFilesAgedOut
        )
    }

    /// Process exit code reported by a delivery worker. Stable contract with
    /// the dispatcher; do not renumber.
    pub fn exit_code(&self) -> i32 {
        use DeliveryError::*;
        match self {
            Connect(_) => 1,
            User(_) => 2,
            Password(_) => 3,
            Chdir(_) => 4,
            Stat(_) => 5,
            Move(_) => 6,
            Rename(_) => 7,
            WriteRemote(_) => 8,
            ReadRemote(_) => 9,
            OpenRemote(_) => 10,
            CloseRemote(_) => 11,
            OpenLocal(_) => 12,
            WriteLocal(_) => 13,
            RemoveLockfile(_) => 14,
            Alloc(_) => 15,
            Syntax(_) => 16,
            Timeout(_) => 17,
            ConnectionReset(_) => 18,
            AllFilesAgedOut => 19,
            UnsupportedScheme(_) => 20,
            GotKilled => 30,
        }
    }

    /// Reverse mapping used by the dispatcher when reaping a worker child.
    /// Context strings are lost across the process boundary by design.
    pub fn from_exit_code(code: i32) -> Option<DeliveryError> {
        use DeliveryError::*;
        let e = match code {
            1 => Connect(String::new()),
            2 => User(String::new()),
            3 => Password(String::new()),
            4 => Chdir(String::new()),
            5 => Stat(String::new()),
            6 => Move(String::new()),
            7 => Rename(String::new()),
            8 => WriteRemote(String::new()),
            9 => ReadRemote(String::new()),
            10 => OpenRemote(String::new()),
            11 => CloseRemote(String::new()),
            12 => OpenLocal(String::new()),
            13 => WriteLocal(String::new()),
            14 => RemoveLockfile(String::new()),
            15 => Alloc(String::new()),
            16 => Syntax(String::new()),
            17 => Timeout(String::new()),
            18 => ConnectionReset(String::new()),
            19 => AllFilesAgedOut,
            20 => UnsupportedScheme(String::new()),
            30 => GotKilled,
            _ => return None,
        };
        Some(e)
    }

    /// Short code name written into transfer-log lines and the error-history
    /// ring display.
    pub fn code_name(&self) -> &'static str {
        use DeliveryError::*;
        match self {
            Connect(_) => "CONNECT_ERROR",
            User(_) => "USER_ERROR",
            Password(_) => "PASSWORD_ERROR",
            Chdir(_) => "CHDIR_ERROR",
            OpenRemote(_) => "OPEN_REMOTE_ERROR",
            ReadRemote(_) => "READ_REMOTE_ERROR",
            WriteRemote(_) => "WRITE_REMOTE_ERROR",
            CloseRemote(_) => "CLOSE_REMOTE_ERROR",
            Move(_) => "MOVE_ERROR",
            Rename(_) => "RENAME_ERROR",
            Stat(_) => "STAT_ERROR",
            WriteLocal(_) => "WRITE_LOCAL_ERROR",
            OpenLocal(_) => "OPEN_LOCAL_ERROR",
            RemoveLockfile(_) => "REMOVE_LOCKFILE_ERROR",
            Alloc(_) => "ALLOC_ERROR",
            Syntax(_) => "SYNTAX_ERROR",
            Timeout(_) => "TIMEOUT_ERROR",
            ConnectionReset(_) => "CONNECTION_RESET",
            AllFilesAgedOut => "ALL_FILES_AGED_OUT",
            UnsupportedScheme(_) => "UNSUPPORTED_SCHEME",
            GotKilled => "GOT_KILLED",
        }
    }
}

/// Errors raised when attaching to a shared mmap region.
///
/// 区域损坏（magic/版本）必须带上版本信息中止 attach；mmap 失败在 attach 阶段即致命。
#[derive(Debug, Clone)]
pub enum StateError {
    BadMagic(std::path::PathBuf, u32),
    /// (path, found_version, built_for)
    VersionMismatch(std::path::PathBuf, u8, u8),
    /// 区域世代号已变化，调用方应重新 attach 后重试
    StaleGeneration(u32, u32),
    TooSmall(std::path::PathBuf, usize),
    IndexOutOfRange(usize, u32),
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use StateError::*;
        match self {
            BadMagic(p, m) => write!(f, "共享区域 magic 损坏: {} (0x{:08x})", p.display(), m),
            VersionMismatch(p, found, built) => {
                write!(f, "共享区域版本不匹配: {} (文件 v{}, 程序 v{})", p.display(), found, built)
            }
            StaleGeneration(seen, now) => {
                write!(f, "共享区域已被替换 (世代 {} -> {})，需要重新 attach", seen, now)
            }
            TooSmall(p, len) => write!(f, "共享区域过小: {} ({} 字节)", p.display(), len),
            IndexOutOfRange(idx, n) => write!(f, "记录下标越界: {} (共 {})", idx, n),
        }
    }
}

impl std::error::Error for StateError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_round_trip() {
        let kinds = [
            DeliveryError::Connect(String::new()),
            DeliveryError::Password(String::new()),
            DeliveryError::Timeout(String::new()),
            DeliveryError::AllFilesAgedOut,
            DeliveryError::GotKilled,
        ];
        for k in kinds {
            let back = DeliveryError::from_exit_code(k.exit_code()).expect("known code");
            assert_eq!(back.code_name(), k.code_name());
        }
    }

    #[test]
    fn success_code_is_not_an_error() {
        assert!(DeliveryError::from_exit_code(0).is_none());
    }

    #[test]
    fn classification_is_consistent() {
        // cancelling errors never ask for a retry
        let cancel = DeliveryError::Stat("x".into());
        assert!(cancel.cancels_message());
        assert!(!cancel.is_retryable());
        // aged-out does not count against the host
        assert!(!DeliveryError::AllFilesAgedOut.counts_against_host());
    }
}
