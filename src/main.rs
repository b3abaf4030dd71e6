//! Okteto CLI entrypoint.
//!
//! This is the main entrypoint for the okteto command-line tool.

use std::path::PathBuf;
use std::process::ExitCode;

use okteto::cli::output;
use okteto::cli::{Cli, Commands, Spinner};
use okteto::error::{Error, Result};
use okteto::home::Home;
use okteto::k8s::{deployments, exec, pods, secrets, services, translate, volumes, ClusterClient};
use okteto::model::{find_manifest, Dev};
use okteto::syncthing::Syncthing;
use okteto::{analytics, up};

use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(cli.verbose);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match &e {
                Error::User(user) => output::user_error(&user.message, &user.hint),
                Error::CommandFailed { .. } => {}
                _ => output::error(&e.to_string()),
            }
            ExitCode::from(u8::try_from(e.exit_code().clamp(1, 255)).unwrap_or(1))
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Up {
            file,
            namespace,
            remote,
            deploy,
            pull,
        } => cmd_up(file.as_ref(), namespace.as_deref(), remote, deploy, pull).await,
        Commands::Down {
            file,
            namespace,
            volumes,
        } => cmd_down(file.as_ref(), namespace.as_deref(), volumes).await,
        Commands::Exec {
            file,
            namespace,
            command,
        } => cmd_exec(file.as_ref(), namespace.as_deref(), &command).await,
        Commands::Status { file, namespace } => {
            cmd_status(file.as_ref(), namespace.as_deref()).await
        }
    }
}

/// Loads and validates the manifest, applying the namespace flag.
fn load_dev(file: Option<&PathBuf>, namespace: Option<&str>) -> Result<Dev> {
    let manifest = find_manifest(file)?;
    let mut dev = Dev::load(&manifest)?;
    if let Some(namespace) = namespace {
        dev.update_namespace(namespace)?;
    }
    Ok(dev)
}

/// Activate the development environment.
async fn cmd_up(
    file: Option<&PathBuf>,
    namespace: Option<&str>,
    remote: Option<u16>,
    deploy: bool,
    pull: bool,
) -> Result<()> {
    let mut dev = load_dev(file, namespace)?;
    if let Some(port) = remote {
        dev.remote_port = port;
    }

    up::run_up(dev, deploy, pull).await
}

/// Restore the original deployment.
async fn cmd_down(file: Option<&PathBuf>, namespace: Option<&str>, remove_volumes: bool) -> Result<()> {
    let mut dev = load_dev(file, namespace)?;
    let client = ClusterClient::local().await?;
    if dev.namespace.is_empty() {
        dev.namespace = client.namespace().to_string();
    }

    let mut spinner = Spinner::new("Deactivating your development environment...");
    spinner.start();
    analytics::track_down(&dev.name);

    match deployments::get(&client, &dev).await {
        Ok(d) => {
            if translate::is_auto_create(&d) {
                deployments::destroy(&client, &dev.name, &dev.namespace).await?;
                services::destroy(&client, &dev).await?;
            } else if translate::is_dev_mode(&d) {
                deployments::restore(&client, &d).await?;
            } else {
                info!("deployment {} is not in dev mode", dev.name);
            }
        }
        Err(e) if e.is_not_found() => {
            debug!("deployment {} not found, nothing to restore", dev.name);
        }
        Err(e) => return Err(e),
    }

    secrets::destroy(&client, &dev).await?;

    let mut syncthing = Syncthing::new(&dev)?;
    syncthing.stop(remove_volumes).await?;

    if remove_volumes {
        volumes::destroy(&client, &dev).await?;
    }

    spinner.stop();
    output::success("Development environment deactivated");
    Ok(())
}

/// Execute a one-shot command in the dev container.
async fn cmd_exec(file: Option<&PathBuf>, namespace: Option<&str>, command: &[String]) -> Result<()> {
    let mut dev = load_dev(file, namespace)?;
    let client = ClusterClient::local().await?;
    if dev.namespace.is_empty() {
        dev.namespace = client.namespace().to_string();
    }

    let d = deployments::get(&client, &dev).await?;
    if !translate::is_dev_mode(&d) {
        return Err(Error::NotDevDeployment);
    }

    let pod = pods::get_dev_pod(&client, &dev, &d).await?;
    let pod_name = pod.metadata.name.clone().unwrap_or_default();
    let container = if dev.container.is_empty() {
        pod.spec
            .as_ref()
            .and_then(|s| s.containers.first())
            .map(|c| c.name.clone())
            .unwrap_or_default()
    } else {
        dev.container.clone()
    };

    let cancel = tokio_util::sync::CancellationToken::new();
    exec::exec_stream(&client, &dev.namespace, &pod_name, &container, command, &cancel).await
}

/// Print the last reported activation state.
async fn cmd_status(file: Option<&PathBuf>, namespace: Option<&str>) -> Result<()> {
    let mut dev = load_dev(file, namespace)?;
    if dev.namespace.is_empty() {
        let client = ClusterClient::local().await?;
        dev.namespace = client.namespace().to_string();
    }

    let home = Home::new(&dev.namespace, &dev.name)?;
    let state = home.read_state()?;

    #[allow(clippy::print_stdout)]
    {
        println!("{state}");
    }
    Ok(())
}
