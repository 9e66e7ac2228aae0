use std::fs::OpenOptions;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_appender::non_blocking;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

mod amg;
mod archive;
mod cli;
mod config;
mod control;
mod dupcheck;
mod error;
mod fd;
mod fifo;
mod logging;
mod msg;
mod options;
mod rename;
mod ruledb;
mod state;
mod timejob;
mod util;
mod workers;

pub use error::DeliveryError;
pub use error::StateError;

static STOP: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_signal(_sig: libc::c_int) {
    if let Some(stop) = STOP.get() {
        stop.store(true, Ordering::SeqCst);
    }
}

fn install_signal_handlers(stop: Arc<AtomicBool>) {
    let _ = STOP.set(stop);
    // SAFETY: handler only touches an atomic.
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    let work = config::WorkDir::resolve(cli.work_dir.clone())?;
    work.ensure_layout()?;
    let cfg = config::Config::init(&work)?;
    init_tracing(&work, cli.debug);

    match cli.command {
        cli::Commands::Ingest {} => {
            let stop = Arc::new(AtomicBool::new(false));
            install_signal_handlers(stop.clone());
            amg::Amg::new(work, cfg).run(stop)
        }
        cli::Commands::Dispatch {} => {
            let stop = Arc::new(AtomicBool::new(false));
            install_signal_handlers(stop.clone());
            fd::Fd::new(work, cfg).run(stop)
        }
        cli::Commands::Run {} => {
            let stop = Arc::new(AtomicBool::new(false));
            install_signal_handlers(stop.clone());
            let amg_work = work.clone();
            let amg_cfg = cfg.clone();
            let amg_stop = stop.clone();
            let ingest = std::thread::spawn(move || {
                if let Err(e) = amg::Amg::new(amg_work, amg_cfg).run(amg_stop) {
                    tracing::error!("[amg] 退出: {}", e);
                }
            });
            let r = fd::Fd::new(work, cfg).run(stop.clone());
            stop.store(true, Ordering::SeqCst);
            let _ = ingest.join();
            r
        }
        cli::Commands::Recover {} => {
            let timeout = Duration::from_secs(cfg.queue_handshake_timeout_secs);
            let stats = fd::recover::run_standalone(&work, timeout)?;
            println!(
                "恢复完成: {} 重入队, {} 孤儿移除, {} 空目录",
                stats.requeued, stats.removed_orphans, stats.removed_empty
            );
            Ok(())
        }
        cli::Commands::Ctl { command } => {
            let ctl = control::CtlClient::new(&work);
            match command {
                cli::CtlCommands::Pause { host } => ctl.send_host(control::PAUSE_HOST, host),
                cli::CtlCommands::Resume { host } => ctl.send_host(control::RESUME_HOST, host),
                cli::CtlCommands::Check {} => ctl.send(control::CHECK_FSA_ENTRIES),
                cli::CtlCommands::Reread {} => ctl.send(control::REREAD_DIR_CONFIG),
                cli::CtlCommands::Flush {} => {
                    let timeout = Duration::from_secs(cfg.queue_handshake_timeout_secs);
                    let ready = ctl.flush_queue(timeout)?;
                    if ready {
                        println!("队列已落盘");
                        ctl.finish_queue_list()?;
                    } else {
                        println!("等待调度进程超时，队列文件按现状使用");
                    }
                    Ok(())
                }
                cli::CtlCommands::Shutdown {} => ctl.send(control::SHUTDOWN),
                cli::CtlCommands::DebugOn { host } => ctl.send_host(control::DEBUG_ON, host),
                cli::CtlCommands::DebugOff { host } => ctl.send_host(control::DEBUG_OFF, host),
            }
        }
        cli::Commands::Deliver { host_idx, slot, msg, toggle, retries } => {
            let task = workers::WorkerTask {
                work,
                cfg,
                host_idx,
                slot,
                msg_name: msg,
                toggle_hint: toggle,
                retries,
            };
            match workers::run_delivery(&task) {
                Ok(()) => Ok(()),
                Err(e) => {
                    // the exit code IS the contract with the dispatcher
                    std::process::exit(e.exit_code());
                }
            }
        }
    }
}

fn init_tracing(work: &config::WorkDir, debug: bool) {
    // All tracing output goes into the canonical debug log file only; the
    // console stays clean for the ctl/recover subcommands.
    let log_path = work.log_dir().join("debug.log");
    let level_str = if debug { "debug" } else { "info" };
    match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => {
            let (non_blocking_writer, guard) = non_blocking(file);
            // Leak the worker guard so the background thread remains alive
            // for the duration of the process.
            let _ = Box::leak(Box::new(guard));
            let file_layer = fmt::layer()
                .with_writer(non_blocking_writer)
                .with_ansi(false)
                .with_filter(EnvFilter::new(level_str));
            tracing_subscriber::registry().with(file_layer).init();
        }
        Err(e) => {
            eprintln!("warning: could not open debug log at {}: {}", log_path.display(), e);
        }
    }
}
