//! Control plane: single-byte opcodes over the command pipe, acknowledged on
//! paired DONE pipes within a bounded timeout.

use std::time::Duration;

use anyhow::Result;

use crate::config::WorkDir;

// command-pipe opcodes
pub const CHECK_FSA_ENTRIES: u8 = 1;
pub const FLUSH_MSG_FIFO_DUMP_QUEUE: u8 = 2;
pub const QUEUE_LIST_READY: u8 = 3;
pub const QUEUE_LIST_EMPTY: u8 = 4;
pub const QUEUE_LIST_DONE: u8 = 5;
pub const SHUTDOWN: u8 = 6;
pub const REREAD_DIR_CONFIG: u8 = 7;
// per-host control: the opcode is followed by one host-index byte
pub const PAUSE_HOST: u8 = 16;
pub const RESUME_HOST: u8 = 17;
pub const DEBUG_ON: u8 = 18;
pub const DEBUG_OFF: u8 = 19;

pub fn opcode_name(op: u8) -> &'static str {
    match op {
        CHECK_FSA_ENTRIES => "CHECK_FSA_ENTRIES",
        FLUSH_MSG_FIFO_DUMP_QUEUE => "FLUSH_MSG_FIFO_DUMP_QUEUE",
        QUEUE_LIST_READY => "QUEUE_LIST_READY",
        QUEUE_LIST_EMPTY => "QUEUE_LIST_EMPTY",
        QUEUE_LIST_DONE => "QUEUE_LIST_DONE",
        SHUTDOWN => "SHUTDOWN",
        REREAD_DIR_CONFIG => "REREAD_DIR_CONFIG",
        PAUSE_HOST => "PAUSE_HOST",
        RESUME_HOST => "RESUME_HOST",
        DEBUG_ON => "DEBUG_ON",
        DEBUG_OFF => "DEBUG_OFF",
        _ => "UNKNOWN",
    }
}

/// Whether this opcode carries a following host-index byte.
pub fn takes_host_byte(op: u8) -> bool {
    matches!(op, PAUSE_HOST | RESUME_HOST | DEBUG_ON | DEBUG_OFF)
}

/// Client side: send one command to a running dispatcher.
pub struct CtlClient<'a> {
    work: &'a WorkDir,
}

impl<'a> CtlClient<'a> {
    pub fn new(work: &'a WorkDir) -> CtlClient<'a> {
        CtlClient { work }
    }

    pub fn send(&self, op: u8) -> Result<()> {
        crate::fifo::mkfifo_if_missing(&self.work.fd_cmd_fifo())?;
        crate::fifo::write_opcode(&self.work.fd_cmd_fifo(), op)?;
        tracing::info!("[ctl] 指令已发送: {}", opcode_name(op));
        Ok(())
    }

    pub fn send_host(&self, op: u8, host_idx: u8) -> Result<()> {
        crate::fifo::mkfifo_if_missing(&self.work.fd_cmd_fifo())?;
        crate::fifo::write_bytes(&self.work.fd_cmd_fifo(), &[op, host_idx])?;
        tracing::info!("[ctl] 指令已发送: {} host#{}", opcode_name(op), host_idx);
        Ok(())
    }

    /// Flush handshake: request the queue dump and wait for READY on the
    /// paired pipe. On expiry the caller continues with the file as-is.
    pub fn flush_queue(&self, timeout: Duration) -> Result<bool> {
        crate::fifo::mkfifo_if_missing(&self.work.queue_list_ready_fifo())?;
        self.send(FLUSH_MSG_FIFO_DUMP_QUEUE)?;
        let got = crate::fifo::await_opcode(&self.work.queue_list_ready_fifo(), timeout)?;
        Ok(got.is_some())
    }

    pub fn finish_queue_list(&self) -> Result<()> {
        crate::fifo::mkfifo_if_missing(&self.work.queue_list_done_fifo())?;
        crate::fifo::write_opcode(&self.work.queue_list_done_fifo(), QUEUE_LIST_DONE)
    }
}
