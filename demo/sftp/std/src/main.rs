//! Serves a directory as an SFTP subsystem on stdin and stdout.
//!
//! Can be used as `sftp -D`, for example
//! `sftp -D "sunset-sftp-demo-std -r /tmp/share"`.
//! Logging goes to stderr.

use anyhow::{Context, Result};

use sunset_sftp::{NameFilter, ServerConfig, SftpHandler};

use crate::demosftpserver::DemoFs;

#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

mod demosftpserver;

#[derive(argh::FromArgs, Debug)]
/** Sunset SFTP server on stdio
 */
struct Args {
    #[argh(switch, short = 'v')]
    /// verbose debug logging
    debug: bool,

    #[argh(switch)]
    /// more verbose
    trace: bool,

    #[argh(option, short = 'r', default = "String::from(\".\")")]
    /// directory to serve
    root: String,

    #[argh(option, default = "6")]
    /// highest protocol version offered, 3 to 6
    max_version: u32,

    #[argh(option)]
    /// limit on bytes written for the session
    quota: Option<u64>,

    #[argh(switch)]
    /// don't list names starting with '.'
    hide_dotfiles: bool,
}

fn setup_log(args: &Args) {
    let level = if args.trace {
        log::LevelFilter::Trace
    } else if args.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::builder()
        .filter_level(log::LevelFilter::Warn)
        .filter_module("sunset_sftp", level)
        .filter_module("sunset_sftp_demo_std", level)
        .target(env_logger::Target::Stderr)
        .format_timestamp_nanos()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Args = argh::from_env();
    setup_log(&args);

    let root = std::fs::canonicalize(&args.root)
        .with_context(|| format!("Bad root directory {}", args.root))?;
    info!("Serving {root:?}");

    let config = ServerConfig {
        max_version: args.max_version,
        upload_quota: args.quota,
        name_filter: args.hide_dotfiles.then(|| NameFilter::new(|n| !n.starts_with('.'))),
        ..Default::default()
    };

    let handler = SftpHandler::new(DemoFs::new(root), config);
    handler
        .process_loop(tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("SFTP session failed")?;
    info!("Session finished");
    Ok(())
}
