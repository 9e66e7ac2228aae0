//! Worker lifecycle: spawn one delivery child per claimed slot, grant bursts
//! to busy hosts, fold exits back into queue and host state.

use std::collections::HashMap;
use std::process::ExitStatus;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;

use crate::DeliveryError;
use crate::config::WorkDir;
use crate::msg::Message;
use crate::state::fsa::{ConnectState, Fsa, MAX_UNIQUE_NAME};
use crate::state::{fixed_str, set_fixed_str};

/// Bookkeeping for one live worker child.
#[derive(Debug, Clone)]
pub struct RunningWorker {
    pub pid: u32,
    pub host_idx: usize,
    pub slot: usize,
    pub msg: Message,
}

pub struct Dispatcher {
    work: WorkDir,
    children: HashMap<u32, RunningWorker>,
    /// Burst messages handed to a slot, oldest first. The worker
    /// acknowledges a grant by clearing the slot's unique_name; only the
    /// newest grant can still be pending at any time.
    burst_grants: HashMap<(usize, usize), Vec<Message>>,
}

/// What a reaped child means for its message(s).
#[derive(Debug)]
pub struct ReapOutcome {
    pub worker: RunningWorker,
    pub result: Result<(), DeliveryError>,
    /// A granted burst the worker never picked up; must be requeued.
    pub unclaimed_burst: Option<Message>,
    /// Granted bursts the worker accepted; their staging dirs decide whether
    /// they still need requeueing after a failed session.
    pub accepted_bursts: Vec<Message>,
}

impl Dispatcher {
    pub fn new(work: WorkDir) -> Dispatcher {
        Dispatcher { work, children: HashMap::new(), burst_grants: HashMap::new() }
    }

    pub fn live_children(&self) -> usize {
        self.children.len()
    }

    pub fn running(&self) -> impl Iterator<Item = &RunningWorker> {
        self.children.values()
    }

    /// Spawn a worker child for `msg` on an already-claimed slot. The waiter
    /// thread reports the exit on `exit_tx` — the supervisor never blocks in
    /// waitpid itself.
    pub fn spawn_worker(
        &mut self,
        fsa: &Fsa,
        host_idx: usize,
        slot: usize,
        msg: Message,
        exit_tx: Sender<(u32, ExitStatus)>,
    ) -> Result<()> {
        let exe = std::env::current_exe().with_context(|| "无法定位自身可执行文件")?;
        let toggle = fsa.read_host(host_idx).map(|h| h.host_toggle).unwrap_or(0);
        let child = std::process::Command::new(exe)
            .arg("deliver")
            .arg("--work-dir")
            .arg(self.work.root())
            .arg("--host-idx")
            .arg(host_idx.to_string())
            .arg("--slot")
            .arg(slot.to_string())
            .arg("--msg")
            .arg(msg.name().to_string())
            .arg("--toggle")
            .arg(toggle.to_string())
            .arg("--retries")
            .arg(msg.retries.to_string())
            .spawn()
            .with_context(|| format!("worker 启动失败: {}", msg.name()))?;
        let pid = child.id();
        let _ = fsa.with_slot_mut(host_idx, slot, |s| s.pid = pid as i32);
        self.children
            .insert(pid, RunningWorker { pid, host_idx, slot, msg: msg.clone() });
        std::thread::spawn(move || {
            let mut child = child;
            match child.wait() {
                Ok(status) => {
                    let _ = exit_tx.send((pid, status));
                }
                Err(e) => {
                    tracing::error!("[fd] waitpid 失败 pid {}: {}", pid, e);
                }
            }
        });
        tracing::info!(
            "[fd] worker 启动: pid {} host#{} slot {} msg {}",
            pid,
            host_idx,
            slot,
            msg.name()
        );
        Ok(())
    }

    /// Offer `msg` to a busy compatible session (same job on the same host)
    /// for delivery over its open connection. Returns true when granted.
    pub fn grant_burst(&mut self, fsa: &Fsa, host_idx: usize, msg: &Message) -> bool {
        let Ok(host) = fsa.read_host(host_idx) else {
            return false;
        };
        let allowed = host.allowed_transfers.clamp(0, host.job_status.len() as i32) as usize;
        for slot in 0..allowed {
            let s = &host.job_status[slot];
            let state = s.connect_state();
            let compatible = (state == ConnectState::Active || state == ConnectState::Burst)
                && s.job_id == msg.job_id
                && fixed_str(&s.unique_name).is_empty();
            if !compatible {
                continue;
            }
            let name = msg.name().to_string();
            if name.len() >= MAX_UNIQUE_NAME {
                return false;
            }
            let ok = fsa
                .with_slot_mut(host_idx, slot, |s| {
                    if fixed_str(&s.unique_name).is_empty() {
                        set_fixed_str(&mut s.unique_name, &name);
                        true
                    } else {
                        false
                    }
                })
                .unwrap_or(false);
            if ok {
                self.burst_grants.entry((host_idx, slot)).or_default().push(msg.clone());
                tracing::info!("[fd] burst 授予: {} -> host#{} slot {}", name, host_idx, slot);
                return true;
            }
        }
        false
    }

    /// Fold one child exit back into supervisor state. Reads the slot before
    /// rewinding it, so an unclaimed burst grant is still visible.
    pub fn reap(&mut self, fsa: &Fsa, pid: u32, status: ExitStatus) -> Option<ReapOutcome> {
        let worker = self.children.remove(&pid)?;
        let result: Result<(), DeliveryError> = match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(DeliveryError::from_exit_code(code)
                .unwrap_or_else(|| DeliveryError::Syntax(format!("未知退出码 {}", code)))),
            None => {
                // killed by signal: the worker's own finaliser may not have
                // run; the slot is rewound below either way
                Err(DeliveryError::GotKilled)
            }
        };
        let mut grants =
            self.burst_grants.remove(&(worker.host_idx, worker.slot)).unwrap_or_default();
        let pending = fsa
            .read_slot(worker.host_idx, worker.slot)
            .map(|s| !fixed_str(&s.unique_name).is_empty())
            .unwrap_or(false);
        // only the newest grant can be unacknowledged
        let unclaimed_burst = if pending { grants.pop() } else { None };
        let accepted_bursts = grants;
        // rewind: normal exits already did this through the worker's guard;
        // for a killed worker this is the reset hook
        let _ = fsa.reset_slot(worker.host_idx, worker.slot);
        Some(ReapOutcome { worker, result, unclaimed_burst, accepted_bursts })
    }
}
