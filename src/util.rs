use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Convert a byte count into a human readable string using IEC units (KiB/MiB/GiB).
pub fn human_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GiB", b / GB)
    } else if b >= MB {
        format!("{:.2} MiB", b / MB)
    } else if b >= KB {
        format!("{:.2} KiB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

// Default backoff base in milliseconds. Can be adjusted at runtime via `set_backoff_ms`.
static BACKOFF_BASE_MS: AtomicU64 = AtomicU64::new(100);

/// Set the base backoff in milliseconds used by `retry_operation` between attempts.
pub fn set_backoff_ms(ms: u64) {
    BACKOFF_BASE_MS.store(ms, Ordering::SeqCst);
}

/// Get the current base backoff in milliseconds used by `retry_operation`.
pub fn get_backoff_ms() -> u64 {
    BACKOFF_BASE_MS.load(Ordering::SeqCst)
}

/// Linear backoff for the given 1-based attempt number.
pub fn compute_backoff_ms(base: u64, attempt: u64) -> u64 {
    base.saturating_mul(attempt)
}

/// Generic retry helper used by workers and tests.
/// `op` should return an anyhow::Result; helper will retry transient failures up to max_retries.
pub fn retry_operation<F, T>(max_retries: usize, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 0..max_retries {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < max_retries {
                    let base = BACKOFF_BASE_MS.load(Ordering::SeqCst);
                    let wait = compute_backoff_ms(base, attempt as u64 + 1);
                    std::thread::sleep(Duration::from_millis(wait));
                    continue;
                } else {
                    break;
                }
            }
        }
    }
    Err(last_err
        .unwrap_or_else(|| crate::DeliveryError::Alloc("operation failed".to_string()).into()))
}

/// 小写十六进制，无前导零填充 — lowercase hex, no padding. Message names and
/// unique counters use this form everywhere.
pub fn to_hex(v: u64) -> String {
    format!("{:x}", v)
}

/// Parse the lowercase-hex form produced by `to_hex`.
pub fn from_hex(s: &str) -> Option<u64> {
    if s.is_empty() {
        return None;
    }
    u64::from_str_radix(s, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_bytes_units() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.00 KiB");
        assert_eq!(human_bytes(3 * 1024 * 1024), "3.00 MiB");
    }

    #[test]
    fn hex_round_trip() {
        for v in [0u64, 1, 0xff, 0xdeadbeef, u32::MAX as u64] {
            assert_eq!(from_hex(&to_hex(v)), Some(v));
        }
        assert_eq!(from_hex(""), None);
    }

    #[test]
    fn retry_gives_up_after_max() {
        let mut calls = 0u32;
        set_backoff_ms(1);
        let r: Result<()> = retry_operation(3, || {
            calls += 1;
            Err(anyhow::anyhow!("nope"))
        });
        assert!(r.is_err());
        assert_eq!(calls, 3);
    }
}
