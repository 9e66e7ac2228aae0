//! Per-host health: error counters, the history ring, auto-pause and the
//! warn-time watchdog.
//!
//! 状态机：Healthy --err--> Warning --err>=max--> Paused --success--> Healthy；
//! Offline 只由操作员设置/清除。

use anyhow::Result;

use crate::DeliveryError;
use crate::state::fsa::{AUTO_PAUSE_QUEUE_STAT, Fsa};

/// What the dispatcher should do with the message after a worker exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Delivered (or the whole message aged out): nothing left to do.
    Done,
    /// Put the message back with this delay in seconds.
    Requeue(i64),
    /// Drop the message and clean its staging directory.
    Cancel,
}

/// Fold one worker exit into host state and decide the message's fate.
/// The worker already updated its own counters; this is the supervisor-side
/// half: auto-pause at the error ceiling, retry pacing, cancellation.
pub fn on_worker_exit(
    fsa: &Fsa,
    host_idx: usize,
    result: &Result<(), DeliveryError>,
    default_retry_interval: i64,
) -> Result<Disposition> {
    match result {
        Ok(()) => Ok(Disposition::Done),
        Err(e) => {
            let host = fsa.read_host(host_idx)?;
            if e.counts_against_host() && host.max_errors > 0 && host.error_counter >= host.max_errors
            {
                // error ceiling reached: stop dispatching until an operator
                // or a successful retry clears it
                fsa.set_status_flags(host_idx, AUTO_PAUSE_QUEUE_STAT, 0)?;
                tracing::warn!(
                    "[fd] 主机 {} 错误计数达到上限 ({}) -> AUTO_PAUSE_QUEUE",
                    host.alias(),
                    host.error_counter
                );
                if host.auto_toggle != 0 {
                    let pos = fsa.toggle_host(host_idx)?;
                    tracing::info!("[fd] 主机 {} 自动切换到位置 {}", host.alias(), pos);
                }
            }
            if matches!(e, DeliveryError::AllFilesAgedOut) {
                return Ok(Disposition::Done);
            }
            if e.cancels_message() {
                return Ok(Disposition::Cancel);
            }
            if e.is_retryable() {
                let interval = if host.retry_interval > 0 {
                    host.retry_interval as i64
                } else {
                    default_retry_interval
                };
                fsa.bump_nack(host_idx)?;
                Ok(Disposition::Requeue(interval))
            } else {
                Ok(Disposition::Cancel)
            }
        }
    }
}

/// Emit a warn event for every host whose last successful connection lies
/// further back than its warn window. Returns the offending host indices.
pub fn check_warn_times(fsa: &Fsa, warn_time: i64, now: i64) -> Vec<usize> {
    if warn_time <= 0 {
        return Vec::new();
    }
    let mut hit = Vec::new();
    for i in 0..fsa.len() {
        let Ok(h) = fsa.read_host(i) else { continue };
        if h.last_connection > 0 && now - h.last_connection > warn_time {
            tracing::warn!(
                "[fd] WARN_TIME_REACHED: {} 已 {} 秒无成功连接",
                h.alias(),
                now - h.last_connection
            );
            hit.push(i);
        }
    }
    hit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::fsa::{HostSeed, PAUSE_QUEUE_STAT};

    fn mk_fsa(dir: &std::path::Path, max_errors: i32) -> Fsa {
        Fsa::create(
            &dir.join("fsa"),
            &[HostSeed {
                alias: "alpha".to_string(),
                max_errors,
                retry_interval: 7,
                ..HostSeed::default()
            }],
        )
        .expect("fsa")
    }

    #[test]
    fn retryable_error_requeues_with_host_interval() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let fsa = mk_fsa(tmp.path(), 10);
        let r: Result<(), DeliveryError> = Err(DeliveryError::Connect("x".into()));
        let d = on_worker_exit(&fsa, 0, &r, 60).expect("disposition");
        assert_eq!(d, Disposition::Requeue(7));
    }

    #[test]
    fn error_ceiling_sets_auto_pause() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let fsa = mk_fsa(tmp.path(), 3);
        for _ in 0..3 {
            fsa.note_error(0, 1, 100).expect("err");
        }
        let r: Result<(), DeliveryError> = Err(DeliveryError::Connect("x".into()));
        let _ = on_worker_exit(&fsa, 0, &r, 60).expect("disposition");
        let h = fsa.read_host(0).expect("read");
        assert!(h.host_status & AUTO_PAUSE_QUEUE_STAT != 0);
        assert!(!h.dispatchable());
        fsa.assert_host_invariants(0).expect("invariants hold under pause");
        // a success clears the pause again
        fsa.note_success(0, 200).expect("ok");
        let h = fsa.read_host(0).expect("read");
        assert!(h.host_status & AUTO_PAUSE_QUEUE_STAT == 0);
        assert_eq!(h.error_counter, 0);
    }

    #[test]
    fn cancel_kinds_do_not_requeue() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let fsa = mk_fsa(tmp.path(), 10);
        let r: Result<(), DeliveryError> = Err(DeliveryError::Stat("gone".into()));
        assert_eq!(on_worker_exit(&fsa, 0, &r, 60).expect("d"), Disposition::Cancel);
        let r: Result<(), DeliveryError> = Err(DeliveryError::AllFilesAgedOut);
        assert_eq!(on_worker_exit(&fsa, 0, &r, 60).expect("d"), Disposition::Done);
    }

    #[test]
    fn operator_pause_respected_by_selection() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let fsa = mk_fsa(tmp.path(), 10);
        fsa.set_status_flags(0, PAUSE_QUEUE_STAT, 0).expect("set");
        assert!(!fsa.read_host(0).expect("read").dispatchable());
        fsa.set_status_flags(0, 0, PAUSE_QUEUE_STAT).expect("clear");
        assert!(fsa.read_host(0).expect("read").dispatchable());
    }
}
