use std::time::Duration;

use clap::Parser;
use console::style;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use vmforge::backend::libvirt::LibvirtClient;
use vmforge::backend::{DomainRunState, TeardownDomains};
use vmforge::cli::{Cli, Command, FormatArg, ImageCommand, OutputFormat, PoolCommand, VolumeCommand};
use vmforge::config::{self, HostConfig};
use vmforge::error::ForgeError;
use vmforge::image;
use vmforge::provision::Provisioner;
use vmforge::storage::{StorageManager, VolumeFormat, VolumeKind, VolumeSpec};
use vmforge::teardown::Decommissioner;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("vmforge=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vmforge=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let host = config::load_host_config(cli.config.as_deref())?;

    // Ctrl+C flips the token; long waits (connect, graceful shutdown) bail
    // out instead of leaving the user staring at a stuck terminal.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    run(cli, host, cancel).await.map_err(Into::into)
}

async fn run(cli: Cli, host: HostConfig, cancel: CancellationToken) -> Result<(), ForgeError> {
    // Load and validate the machine spec before touching libvirt, so a bad
    // spec never costs a connection attempt.
    let machine = match &cli.command {
        Command::Create { spec } => Some(config::load_machine_spec(spec)?),
        _ => None,
    };

    let client = LibvirtClient::connect(
        &host.libvirt_uri,
        Duration::from_secs(host.connect_timeout_secs),
        host.volume_owner,
        &cancel,
    )
    .await?;
    let storage = StorageManager::new(client.clone(), host.pool_layout());
    storage.ensure_default_pools()?;

    match cli.command {
        Command::Create { .. } => {
            let spec = machine.expect("loaded above for Create");
            let name = spec.name.clone();
            let provisioner = Provisioner::new(client.clone(), storage);
            let status = provisioner.create(&spec)?;
            if cli.output == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&status).expect("JSON serialization"));
            } else {
                println!("VM '{name}' is {}.", style(status.phase).green());
                for iface in &status.interfaces {
                    println!("  mac: {}  tap: {}", iface.mac, iface.tap);
                }
            }
        }
        Command::Destroy { name } => {
            let decommissioner = Decommissioner::new(client.clone(), storage);
            let spinner = indicatif::ProgressBar::new_spinner();
            spinner.set_message(format!("Destroying VM '{name}'..."));
            spinner.enable_steady_tick(Duration::from_millis(120));
            let result = decommissioner.destroy(&name, &cancel).await;
            spinner.finish_and_clear();
            let report = result?;
            if report.forced_off {
                println!("VM '{name}' was force stopped.");
            }
            for vol in &report.volumes_deleted {
                println!("  deleted {vol}");
            }
            for vol in &report.volumes_failed {
                println!("  {} to delete {vol}", style("FAILED").red());
            }
            println!("VM '{name}' destroyed.");
        }
        Command::Status { name } => {
            print_status(&client, &name, cli.output)?;
        }
        Command::Pool { action } => match action {
            PoolCommand::List { names } => {
                let layout = storage.layout();
                let mut all = vec![layout.images_pool.clone(), layout.vms_pool.clone()];
                all.extend(names);
                let pools = storage.list_pools(&all)?;
                if cli.output == OutputFormat::Json {
                    println!("{}", serde_json::to_string_pretty(&pools).expect("JSON serialization"));
                } else {
                    for pool in &pools {
                        println!(
                            "  {}  {:?}  {}  {} free",
                            pool.name,
                            pool.state,
                            pool.path,
                            image::format_size(pool.available)
                        );
                    }
                }
            }
            PoolCommand::Create { name, path } => {
                storage.create_pool(&name, &path)?;
                println!("Pool '{name}' created at {path}.");
            }
            PoolCommand::Delete { name, force } => {
                storage.delete_pool(&name, force)?;
                println!("Pool '{name}' deleted.");
            }
        },
        Command::Volume { action } => match action {
            VolumeCommand::List { pool } => {
                let volumes = storage.list_volumes(&pool)?;
                if cli.output == OutputFormat::Json {
                    println!("{}", serde_json::to_string_pretty(&volumes).expect("JSON serialization"));
                } else if volumes.is_empty() {
                    println!("No volumes in pool '{pool}'.");
                } else {
                    for vol in &volumes {
                        println!("  {}  {}", vol.name, image::format_size(vol.capacity));
                    }
                }
            }
            VolumeCommand::Create {
                pool,
                name,
                size_gb,
                format,
            } => {
                let spec = VolumeSpec {
                    name: name.clone(),
                    kind: VolumeKind::Data,
                    format: match format {
                        FormatArg::Qcow2 => VolumeFormat::Qcow2,
                        FormatArg::Raw => VolumeFormat::Raw,
                    },
                    capacity_bytes: size_gb * vmforge::storage::GIB,
                    backing_volume: None,
                };
                storage.create_volume(&pool, &spec)?;
                println!("Volume '{name}' created in pool '{pool}'.");
            }
            VolumeCommand::Delete { pool, name } => {
                storage.delete_volume(&pool, &name)?;
                println!("Volume '{name}' deleted from pool '{pool}'.");
            }
        },
        Command::Image { action } => match action {
            ImageCommand::Import { file, name } => {
                let name = match name {
                    Some(name) => name,
                    None => file
                        .file_name()
                        .map(|f| f.to_string_lossy().into_owned())
                        .ok_or_else(|| ForgeError::validation("image path has no file name"))?,
                };
                let info = storage.import_image(&file, &name)?;
                println!("Imported '{}' ({}).", info.name, image::format_size(info.capacity));
            }
            ImageCommand::Fetch { url, name } => {
                let name = name.unwrap_or_else(|| {
                    url.rsplit('/').next().unwrap_or("image.qcow2").to_string()
                });
                let staging = dirs::cache_dir()
                    .unwrap_or_else(std::env::temp_dir)
                    .join("vmforge");
                let info = image::fetch_and_import(&storage, &url, &name, &staging).await?;
                println!("Imported '{}' ({}).", info.name, image::format_size(info.capacity));
            }
            ImageCommand::List => image::print_images(&storage)?,
        },
    }

    Ok(())
}

fn print_status(client: &LibvirtClient, name: &str, output: OutputFormat) -> Result<(), ForgeError> {
    #[derive(serde::Serialize)]
    struct StatusJson<'a> {
        name: &'a str,
        defined: bool,
        state: &'a str,
        uuid: Option<String>,
    }

    let (defined, state, uuid) = match client.lookup_domain(name)? {
        Some(uuid) => {
            let state = match client.domain_state(name)? {
                DomainRunState::Running => "running",
                DomainRunState::Paused => "paused",
                DomainRunState::ShutOff => "shut off",
                DomainRunState::Other => "in transition",
            };
            (true, state, Some(uuid))
        }
        None => (false, "not defined", None),
    };

    if output == OutputFormat::Json {
        let status = StatusJson {
            name,
            defined,
            state,
            uuid,
        };
        println!("{}", serde_json::to_string_pretty(&status).expect("JSON serialization"));
    } else {
        println!("VM '{name}': {state}");
        if let Some(uuid) = uuid {
            println!("  uuid: {uuid}");
        }
    }
    Ok(())
}
