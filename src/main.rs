use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::Parser;
use fuser::MountOption;
use log::{error, info, LevelFilter};
use pretty_env_logger::env_logger::Builder;

use tagmount::cli::Args;
use tagmount::fs::TagFs;
use tagmount::store::Store;

fn main() -> ExitCode {
    let args = Args::parse();
    setup_logger(args.verbose);

    let store = match prepare(&args) {
        Ok(store) => store,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::from(1);
        }
    };

    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    let fs = TagFs::new(store, uid, gid);

    let mut options = vec![
        MountOption::FSName("tagmount".to_owned()),
        MountOption::AutoUnmount,
        MountOption::DefaultPermissions,
    ];
    options.extend(args.options.iter().map(|o| parse_option(o)));

    info!("mounting at {}", args.mountpoint.display());
    match fuser::mount2(fs, &args.mountpoint, &options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("mount failed: {e}");
            ExitCode::from(2)
        }
    }
}

/// Everything that has to be true before we talk to the kernel. Failures
/// here are configuration errors, not mount errors.
fn prepare(args: &Args) -> anyhow::Result<Store> {
    let mountpoint = args
        .mountpoint
        .canonicalize()
        .with_context(|| format!("mountpoint {}", args.mountpoint.display()))?;
    if !mountpoint.is_dir() {
        bail!("mountpoint {} is not a directory", mountpoint.display());
    }
    if std::fs::read_dir(&mountpoint)?.next().is_some() {
        bail!("mountpoint {} is not empty", mountpoint.display());
    }

    let datastore = args
        .datastore
        .canonicalize()
        .with_context(|| format!("datastore {}", args.datastore.display()))?;
    if !datastore.is_dir() {
        bail!("datastore {} is not a directory", datastore.display());
    }
    if datastore.starts_with(&mountpoint) {
        bail!("datastore must not live inside the mountpoint");
    }

    Store::open(&datastore).context("opening datastore")
}

fn parse_option(opt: &str) -> MountOption {
    match opt {
        "auto_unmount" => MountOption::AutoUnmount,
        "allow_other" => MountOption::AllowOther,
        "allow_root" => MountOption::AllowRoot,
        "ro" => MountOption::RO,
        "rw" => MountOption::RW,
        "exec" => MountOption::Exec,
        "noexec" => MountOption::NoExec,
        "atime" => MountOption::Atime,
        "noatime" => MountOption::NoAtime,
        "sync" => MountOption::Sync,
        "async" => MountOption::Async,
        "dirsync" => MountOption::DirSync,
        other => MountOption::CUSTOM(other.to_owned()),
    }
}

fn setup_logger(verbosity: u8) {
    let mut builder = Builder::new();

    builder.filter_level(match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    });

    builder.format_timestamp_secs();

    builder.init();
}
