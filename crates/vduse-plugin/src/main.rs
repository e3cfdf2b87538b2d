use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use vduse_plugin::cdi::FsSpecStore;
use vduse_plugin::config::{CleanupArgs, Cli, Commands, DaemonArgs};
use vduse_plugin::deviceinfo::DeviceInfoStore;
use vduse_plugin::logging;
use vduse_plugin::plugin::VdusePlugin;
use vduse_plugin::pool::Pool;
use vduse_plugin::vduse::{DeviceProvisioner, VduseManager};

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::Cleanup(cleanup_args) => run_cleanup(cleanup_args).await,
    }
}

async fn run_daemon(args: DaemonArgs) -> Result<()> {
    logging::init();
    info!(
        "starting vduse device plugin {} for {}/{}",
        env!("CARGO_PKG_VERSION"),
        args.resource_prefix,
        args.resource_kind
    );

    let manager = Arc::new(VduseManager::new());
    manager
        .start()
        .await
        .context("failed to disable vdpa autoprobe")?;

    let pool = Arc::new(Pool::new(
        args.pool_name.clone(),
        args.resource_prefix.clone(),
        args.resource_kind.clone(),
        args.num_devices,
        manager,
        Arc::new(FsSpecStore::new(&args.cdi_spec_dir)),
        DeviceInfoStore::new(&args.device_info_dir),
    ));

    // partial provisioning failures are logged, the pool serves whatever
    // succeeded
    for err in pool.start().await {
        error!("provisioning failure: {err}");
    }
    if let Err(e) = pool.write_cdi_spec().await {
        error!("failed to publish CDI spec: {e}");
    }

    let plugin = VdusePlugin::new(
        pool.clone(),
        args.cdi,
        &args.plugin_dir,
        Duration::from_secs(args.update_interval),
    );
    if let Err(e) = plugin.start().await {
        for err in pool.stop().await {
            warn!("teardown failure: {err}");
        }
        return Err(e.context("failed to start device plugin server"));
    }

    wait_for_shutdown(&plugin).await?;

    plugin.stop();
    for err in pool.stop().await {
        error!("teardown failure: {err}");
    }

    if plugin.registration_failed() {
        bail!("kubelet rejected plugin registration");
    }
    Ok(())
}

async fn wait_for_shutdown(plugin: &VdusePlugin) -> Result<()> {
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
        _ = plugin.cancelled() => info!("server cancelled, shutting down"),
    }
    Ok(())
}

/// Out-of-band teardown for devices and descriptor files left behind by a
/// crashed daemon.
async fn run_cleanup(args: CleanupArgs) -> Result<()> {
    logging::init();
    info!("cleaning up vduse devices and descriptor files");

    let manager = VduseManager::new();
    let device_info_store = DeviceInfoStore::new(&args.device_info_dir);
    let resource = format!("{}/{}", args.resource_prefix, args.pool_name);

    for i in 0..args.num_devices {
        let name = format!("{}{}", args.resource_kind, i);
        if let Err(e) = manager.destroy(&name).await {
            warn!("{e}");
        }
        if let Err(e) = device_info_store.clean(&resource, &name) {
            warn!("{e}");
        }
    }

    remove_published_specs(&args)
}

fn remove_published_specs(args: &CleanupArgs) -> Result<()> {
    let kind_prefix = format!("{}-{}-", args.resource_prefix, args.resource_kind);
    let pool_suffix = format!("-{}.json", args.pool_name);

    let entries = match std::fs::read_dir(&args.cdi_spec_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).context("failed to read CDI spec directory"),
    };
    for entry in entries {
        let entry = entry.context("failed to read CDI spec directory")?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(&kind_prefix) && name.ends_with(&pool_suffix) {
            info!("removing CDI spec {name}");
            if let Err(e) = std::fs::remove_file(entry.path()) {
                warn!("failed to remove {name}: {e}");
            }
        }
    }
    Ok(())
}
