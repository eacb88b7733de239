mod config;
mod modes;
mod reply;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::reply::ReplyCode;

/// VLBI stream recorder daemon: runs one configured transfer chain.
#[derive(Parser, Debug)]
#[command(name = "vbsd", about = "VLBI data-acquisition transfer daemon")]
struct Cli {
    /// Transfer description (TOML).
    #[arg(short, long)]
    config: PathBuf,

    /// Log filter, overriding RUST_LOG.
    #[arg(long)]
    log: Option<String>,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_interrupt_handler() {
    let action = SigAction::new(
        SigHandler::Handler(on_interrupt),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        // Safety: the handler only stores into an atomic.
        if let Err(e) = unsafe { sigaction(sig, &action) } {
            tracing::warn!(signal = %sig, error = %e, "failed to install handler");
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = cli
        .log
        .clone()
        .map(tracing_subscriber::EnvFilter::new)
        .unwrap_or_else(|| {
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vbsd=info,streams=info,chain=info".into())
        });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let code = run(&cli);
    std::process::exit(code.code() as i32);
}

fn run(cli: &Cli) -> ReplyCode {
    let cfg = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "bad configuration");
            return ReplyCode::Syntax;
        }
    };
    tracing::info!(mode = ?cfg.mode, scan = %cfg.scan, "vbsd starting");

    install_interrupt_handler();

    let (mut chain, finite) = match modes::build(&cfg) {
        Ok(x) => x,
        Err(e) => {
            tracing::error!(error = %e, "cannot build transfer chain");
            return ReplyCode::Syntax;
        }
    };

    if let Err(e) = chain.run() {
        tracing::error!(error = %e, "cannot start transfer chain");
        return reply::classify_chain(&e);
    }

    if finite {
        // the producer runs dry on its own
        chain.wait();
    } else {
        while !SHUTDOWN.load(Ordering::SeqCst) && !chain.broken() {
            std::thread::sleep(Duration::from_millis(100));
        }
        tracing::info!("stopping transfer");
        chain.stop();
    }

    if chain.broken() {
        tracing::error!("transfer ended with a stage failure");
        ReplyCode::Error
    } else {
        tracing::info!("transfer complete");
        ReplyCode::Success
    }
}
