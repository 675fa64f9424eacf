// SPDX-License-Identifier: Apache-2.0

//! Thin entry point: wires the real collaborators (rtnetlink, mozim,
//! the IPv4LL engine, nispor, the system D-Bus) into a [`linkd::Manager`]
//! and runs it, the way `nipartd`'s `main.rs` wires its daemon up before
//! handing off to `NipartDaemon::run`.

use std::sync::Arc;

use linkd::{
    Config, DbusHostnameSetter, FileResolverUpdater, MozimDhcpV4Factory,
    Ipv4LlEngineFactory, Manager, NisporDeviceEnumerator, RtNetlinkDriver,
    StaticProfileMatcher,
};

#[derive(clap::Parser, Debug)]
#[command(name = "linkd", about = "Per-interface network configuration daemon")]
struct Cli {
    /// Directory link state snapshots are written to.
    #[arg(long)]
    state_dir: Option<std::path::PathBuf>,

    /// Directory DHCP leases are written to.
    #[arg(long)]
    lease_dir: Option<std::path::PathBuf>,

    /// Increase verbosity; repeatable.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() {
    let cli: Cli = clap::Parser::parse();

    let mut config = Config::from_env();
    if let Some(dir) = cli.state_dir {
        config.state_dir = dir;
    }
    if let Some(dir) = cli.lease_dir {
        config.lease_dir = dir;
    }
    config.log_level = match cli.verbose {
        0 => config.log_level,
        1 => linkd::LogLevel::Debug,
        _ => linkd::LogLevel::Trace,
    };
    linkd::init_logging(config.log_level);

    if let Err(e) = run(config).await {
        log::error!("linkd: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), linkd::LinkError> {
    std::fs::create_dir_all(&config.state_dir).map_err(|e| {
        linkd::LinkError::new(
            linkd::ErrorKind::Bug,
            format!("failed to create {}: {e}", config.state_dir.display()),
        )
    })?;
    std::fs::create_dir_all(&config.lease_dir).map_err(|e| {
        linkd::LinkError::new(
            linkd::ErrorKind::Bug,
            format!("failed to create {}: {e}", config.lease_dir.display()),
        )
    })?;

    let (event_tx, event_rx) = tokio::sync::mpsc::channel(256);

    let (conn, handle, _messages) = rtnetlink::new_connection().map_err(|e| {
        linkd::LinkError::new(
            linkd::ErrorKind::Bug,
            format!("failed to open netlink socket: {e}"),
        )
    })?;
    tokio::spawn(conn);
    let kernel = RtNetlinkDriver::new(handle, event_tx.clone());

    let hostname: Arc<dyn linkd::HostnameSetter> =
        Arc::new(DbusHostnameSetter::new().await?);

    let mut manager = Manager::new(
        config,
        kernel,
        Box::new(MozimDhcpV4Factory),
        Box::new(Ipv4LlEngineFactory),
        hostname,
        Box::new(FileResolverUpdater::default()),
        Box::new(NisporDeviceEnumerator),
        // Profile ingestion (parsing .network/.netdev files and
        // matching them to interfaces) is a separate subsystem that
        // isn't part of this crate; until one is wired in, no profile
        // is ever matched and links stay in INITIALIZING.
        Box::new(StaticProfileMatcher(None)),
        event_tx.clone(),
        event_rx,
    );

    tokio::spawn(linkd::run_monitor(event_tx));
    manager.run().await;
    Ok(())
}
