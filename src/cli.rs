use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Work directory (falls back to $DP_WORK_DIR, then ~/.distpilot)
    #[clap(long, global = true)]
    pub work_dir: Option<PathBuf>,
    /// Verbose tracing into <work>/log/debug.log
    #[clap(long, global = true)]
    pub debug: bool,
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Run the ingest daemon (scan, classify, stage)", display_order = 1)]
    Ingest {},
    #[clap(about = "Run the dispatch daemon (queue, workers, health)", display_order = 2)]
    Dispatch {},
    #[clap(about = "Run ingest and dispatch together in one process", display_order = 3)]
    Run {},
    #[clap(about = "Sweep the staging tree and reconcile the queue", display_order = 4)]
    Recover {},
    #[clap(about = "Send a control command to the dispatcher", display_order = 5)]
    Ctl {
        #[clap(subcommand)]
        command: CtlCommands,
    },
    // 由调度进程启动，单次投递会话 — launched by the dispatcher, one delivery session
    #[clap(hide(true))]
    Deliver {
        #[clap(long)]
        host_idx: usize,
        #[clap(long)]
        slot: usize,
        #[clap(long)]
        msg: String,
        #[clap(long)]
        toggle: Option<u8>,
        #[clap(long, default_value_t = 0)]
        retries: u32,
    },
}

#[derive(Subcommand, Debug)]
pub enum CtlCommands {
    #[clap(about = "Pause dispatching to one host")]
    Pause { host: u8 },
    #[clap(about = "Resume dispatching to one host")]
    Resume { host: u8 },
    #[clap(about = "Re-validate shared regions after a config reread")]
    Check {},
    #[clap(about = "Tell the dispatcher the rule database was republished")]
    Reread {},
    #[clap(about = "Flush and dump the queue (queue-list handshake)")]
    Flush {},
    #[clap(about = "Shut the dispatcher down")]
    Shutdown {},
    #[clap(about = "Raise per-host debug level")]
    DebugOn { host: u8 },
    #[clap(about = "Clear per-host debug level")]
    DebugOff { host: u8 },
}
