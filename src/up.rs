//! The activation loop.
//!
//! One `okteto up` runs as a supervisor that installs the dev-mode
//! overlay, gates on the dev pod, wires the port-forward bundle, brings
//! the file synchronization to steady state and hands the developer a
//! shell in the container. Losing the synchronization or the pod does
//! not end the session: the loop tears the cycle down and re-converges
//! until the user exits or the overlay disappears.

use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::analytics;
use crate::cli::output;
use crate::cli::Spinner;
use crate::error::{Error, Result, SyncError, UserError};
use crate::home::{ActivationState, Home};
use crate::k8s::{deployments, exec, pods, secrets, services, translate, volumes};
use crate::k8s::{ClusterClient, PortForwardManager};
use crate::model::{Dev, SYNC_GUI_PORT, SYNC_TCP_PORT};
use crate::ssh;
use crate::syncthing::{Syncthing, FOLDER_TYPE_SEND_RECEIVE};

/// Message shown when the loop re-enters its reconnect branch.
const RECONNECTING_MESSAGE: &str =
    "\nConnection lost to your development environment, reconnecting...\n";

/// Shutdown budget per subsystem.
const SHUTDOWN_BUDGET: Duration = Duration::from_millis(500);

/// Progress bar width relative to the terminal.
const PROGRESS_BAR_SCALING: f64 = 0.30;

/// First command run in the container: refresh the okteto binaries and
/// kill any straggler from a previous session.
const CLEAN_COMMAND: &str = "((cp /var/okteto/bin/* /usr/local/bin); (ps -ef | grep -v -E '/var/okteto/bin/start.sh|/var/okteto/bin/syncthing|PPID' | awk '{print $2}' | xargs -r kill -9)) >/dev/null 2>&1";

/// The common context of all operations performed during the up
/// command. Exactly one exists per process.
struct UpContext {
    dev: Dev,
    client: ClusterClient,
    home: Home,
    pod: String,
    container: String,
    syncthing: Option<Syncthing>,
    forwarder: Option<PortForwardManager>,
    cancel: CancellationToken,
    retry: bool,
    is_swap: bool,
    success: bool,
}

/// Runs the up sequence until the remote command exits, the user
/// interrupts, or an unrecoverable error surfaces.
///
/// # Errors
///
/// Returns the error that ended the activation; the caller maps it to
/// the process exit code.
pub async fn run_up(mut dev: Dev, auto_deploy: bool, force_pull: bool) -> Result<()> {
    debug!("starting up command");

    if dev.remote_mode_enabled() {
        dev.load_remote();
    }
    if force_pull {
        dev.load_force_pull();
    }

    let client = ClusterClient::local().await?;
    if dev.namespace.is_empty() {
        dev.namespace = client.namespace().to_string();
    }
    let home = Home::new(&dev.namespace, &dev.name)?;

    let mut up = UpContext {
        dev,
        client,
        home,
        pod: String::new(),
        container: String::new(),
        syncthing: None,
        forwarder: None,
        cancel: CancellationToken::new(),
        retry: false,
        is_swap: false,
        success: false,
    };

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            debug!("CTRL+C received, starting shutdown sequence");
            eprintln!();
            Ok(())
        }
        result = up.activate(auto_deploy) => result,
    };

    up.shutdown().await;

    if result.is_err() {
        let _ = up.home.write_state(ActivationState::Failed);
        if !up.success {
            analytics::track_up_error(up.is_swap);
        }
    }

    result
}

impl UpContext {
    /// The activation loop: each iteration is one cycle, re-entered on
    /// reconnect.
    async fn activate(&mut self, auto_deploy: bool) -> Result<()> {
        loop {
            self.cancel = CancellationToken::new();
            self.home.new_cycle();
            let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);
            let (errors_tx, mut errors_rx) = mpsc::channel::<String>(8);
            let (cleaned_tx, cleaned_rx) = oneshot::channel::<()>();
            let (running_tx, mut running_rx) = mpsc::channel::<Result<()>>(1);

            let (d, create) = self.get_current_deployment(auto_deploy).await?;
            if !self.retry {
                analytics::track_up(&self.dev.name, self.dev.services.is_empty(), self.is_swap);
            }

            self.dev_mode(&d, create, &disconnect_tx, &errors_tx, cleaned_tx)
                .await?;
            output::success("Development environment activated");

            if let Err(e) = self.sync(&disconnect_tx).await {
                if !pods::exists(&self.client, &self.dev.namespace, &self.pod).await {
                    output::warning(RECONNECTING_MESSAGE);
                    self.shutdown().await;
                    continue;
                }
                return Err(e);
            }

            self.success = true;
            if self.retry {
                analytics::track_reconnect(self.is_swap);
            }
            self.retry = true;

            output::display_context("Files synchronized", &self.dev);

            self.home.write_state(ActivationState::Ready)?;
            self.spawn_run_command(cleaned_rx, running_tx);

            let prev = self
                .wait_until_exit(&mut running_rx, &mut errors_rx, &mut disconnect_rx)
                .await;

            match prev {
                Ok(()) => return Ok(()),
                Err(Error::LostConnection) => {}
                Err(e @ Error::CommandFailed { .. }) => {
                    if pods::exists(&self.client, &self.dev.namespace, &self.pod).await {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }

            output::warning(RECONNECTING_MESSAGE);
            self.shutdown().await;
        }
    }

    /// Resolves the deployment to put in dev mode, or a sandbox when
    /// auto-deploy applies.
    async fn get_current_deployment(&mut self, auto_deploy: bool) -> Result<(Deployment, bool)> {
        match deployments::get(&self.client, &self.dev).await {
            Ok(d) => {
                if !translate::is_auto_create(&d) {
                    self.is_swap = true;
                }
                Ok((d, false))
            }
            Err(e) if e.is_not_found() && !self.retry => {
                if !self.dev.labels.is_empty() {
                    return Err(Error::User(UserError::new(
                        format!(
                            "Didn't find a deployment in namespace {} that matches the labels in your okteto manifest",
                            self.dev.namespace
                        ),
                        "Update your labels or use a different namespace and try again",
                    )));
                }

                let deploy = auto_deploy
                    || std::env::var("OKTETO_AUTODEPLOY").is_ok()
                    || output::ask_yes_no(&format!(
                        "Deployment {} doesn't exist in namespace {}. Do you want to create a new one? [y/n]: ",
                        self.dev.name, self.dev.namespace
                    ));
                if !deploy {
                    return Err(Error::User(UserError::new(
                        format!(
                            "Deployment {} doesn't exist in namespace {}",
                            self.dev.name, self.dev.namespace
                        ),
                        "Deploy your application first or use a different namespace and try again",
                    )));
                }

                Ok((translate::sandbox(&self.dev), true))
            }
            // The overlay disappeared between cycles.
            Err(e) if e.is_not_found() && self.retry => Err(Error::NotDevDeployment),
            Err(e) => Err(e),
        }
    }

    /// Installs the overlay: volumes, secret, translated deployment,
    /// pod readiness, clean command, port forwards and ssh entry.
    async fn dev_mode(
        &mut self,
        d: &Deployment,
        create: bool,
        disconnect_tx: &mpsc::Sender<()>,
        errors_tx: &mpsc::Sender<String>,
        cleaned_tx: oneshot::Sender<()>,
    ) -> Result<()> {
        let mut spinner = Spinner::new("Activating your development environment...");
        self.home.write_state(ActivationState::Activating)?;
        spinner.start();

        self.resolve_container(d)?;
        if self.retry && !translate::is_dev_mode(d) {
            return Err(Error::NotDevDeployment);
        }

        volumes::create(&self.client, &self.dev).await?;

        self.home.write_state(ActivationState::Starting)?;

        let syncthing = Syncthing::new(&self.dev)?;

        info!("create deployment secrets");
        secrets::create(&self.client, &self.dev, &syncthing).await?;

        let translated = translate::translate(&self.dev, d)?;
        deployments::deploy(&self.client, &translated, create).await?;
        if create && self.dev.services.is_empty() {
            services::create(&self.client, &self.dev).await?;
        }

        self.home.write_state(ActivationState::Attaching)?;
        spinner.update("Attaching persistent volume...");

        let (reporter_tx, mut reporter_rx) = mpsc::channel::<String>(8);
        let pod = {
            let wait = pods::wait_until_ready(
                &self.client,
                &self.dev,
                &translated,
                reporter_tx,
                &self.cancel,
            );
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    result = &mut wait => break result?,
                    Some(message) = reporter_rx.recv() => {
                        if message.starts_with("Pulling") {
                            self.home.write_state(ActivationState::Pulling)?;
                        }
                        spinner.update(&format!("{message}..."));
                    }
                }
            }
        };
        self.pod = pod.metadata.name.clone().unwrap_or_default();

        self.spawn_clean_command(cleaned_tx);

        let mut forwarder = PortForwardManager::new(
            self.client.clone(),
            &self.dev.namespace,
            disconnect_tx.clone(),
            errors_tx.clone(),
            self.cancel.child_token(),
        );
        for forward in &self.dev.forward {
            match &forward.service_name {
                Some(service) => {
                    let port = if forward.remote == 0 { forward.local } else { forward.remote };
                    forwarder.add_service(forward.local, service, port)?;
                }
                None => forwarder.add(forward.local, forward.remote)?,
            }
        }
        forwarder.add_required(syncthing.remote_port(), SYNC_TCP_PORT)?;
        forwarder.add_required(syncthing.remote_gui_port(), SYNC_GUI_PORT)?;
        forwarder.start(&self.pod).await?;
        self.forwarder = Some(forwarder);

        if self.dev.remote_mode_enabled() {
            ssh::add_entry(&self.dev.name, self.dev.remote_port, &self.dev.remote_forward)?;
        }

        self.syncthing = Some(syncthing);
        spinner.stop();
        Ok(())
    }

    /// Picks the dev container inside the deployment and defaults the
    /// dev image from it.
    fn resolve_container(&mut self, d: &Deployment) -> Result<()> {
        let containers = d
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .map(|s| s.containers.as_slice())
            .unwrap_or_default();

        let target = if self.dev.container.is_empty() {
            containers.first()
        } else {
            containers.iter().find(|c| c.name == self.dev.container)
        };
        let Some(target) = target else {
            return Err(Error::User(UserError::new(
                format!(
                    "Container '{}' does not exist in deployment '{}'",
                    self.dev.container, self.dev.name
                ),
                "Update the 'container' field in your okteto manifest and try again",
            )));
        };

        self.container = target.name.clone();
        self.dev.container = target.name.clone();
        if self.dev.image.is_empty() {
            self.dev.image = target.image.clone().unwrap_or_default();
        }
        Ok(())
    }

    /// Brings the synchronization to steady state.
    async fn sync(&mut self, disconnect_tx: &mpsc::Sender<()>) -> Result<()> {
        self.start_local_syncthing().await?;
        self.synchronize_files(disconnect_tx).await
    }

    async fn start_local_syncthing(&mut self) -> Result<()> {
        let mut spinner = Spinner::new("Starting the file synchronization service...");
        self.home.write_state(ActivationState::StartingSync)?;
        spinner.start();

        let syncthing = self
            .syncthing
            .as_mut()
            .ok_or_else(|| Error::internal("synchronization service was not initialized"))?;

        syncthing.run(&self.dev).await?;
        syncthing.wait_for_ping(&self.cancel, true).await?;
        if syncthing.wait_for_ping(&self.cancel, false).await.is_err() {
            return Err(Error::User(UserError::new(
                "Failed to connect to the synchronization service",
                "If you are using a non-root container, set the securityContext.runAsUser, securityContext.runAsGroup and securityContext.fsGroup fields in your okteto manifest.\nRun 'okteto down -v' to reset the synchronization service and try again.",
            )));
        }

        if let Err(e) = syncthing.send_stignore(&self.dev).await {
            info!("failed to send stignore: {e}");
        }
        syncthing.wait_for_scanning(&self.cancel, &self.dev, true).await?;
        Ok(())
    }

    async fn synchronize_files(&mut self, disconnect_tx: &mpsc::Sender<()>) -> Result<()> {
        let postfix = "Synchronizing your files...";
        let mut spinner = Spinner::new(postfix);
        self.home.write_state(ActivationState::Synchronizing)?;
        spinner.start();

        let syncthing = self
            .syncthing
            .as_mut()
            .ok_or_else(|| Error::internal("synchronization service was not initialized"))?;

        let (report_tx, mut report_rx) = mpsc::channel::<f64>(8);
        let mut previous = 0.0f64;
        let result = {
            let completion = syncthing.wait_for_completion(&self.cancel, &self.dev, report_tx);
            tokio::pin!(completion);
            loop {
                tokio::select! {
                    result = &mut completion => break result,
                    Some(value) = report_rx.recv() => {
                        // out-of-order drops are discarded
                        if value > previous {
                            previous = value;
                            spinner.update(&output::render_progress_bar(postfix, value, PROGRESS_BAR_SCALING));
                        }
                    }
                }
            }
        };

        if let Err(e) = result {
            if let Error::Sync(SyncError::Frozen { log_path }) = &e {
                analytics::track_sync_error();
                return Err(Error::User(UserError::new(
                    "the file synchronization service is frozen",
                    format!(
                        "Please try again. If the problem persists, check the synchronization log ({})",
                        log_path.display()
                    ),
                )));
            }
            return Err(e);
        }

        spinner.update(&output::render_progress_bar(postfix, 100.0, PROGRESS_BAR_SCALING));

        syncthing
            .update_folder_type(&self.dev, FOLDER_TYPE_SEND_RECEIVE)
            .await?;
        syncthing.restart(&self.cancel).await?;

        let _monitor = syncthing.monitor_task(self.cancel.child_token(), disconnect_tx.clone());
        Ok(())
    }

    /// Runs the clean command in the background; `cleaned_tx` fires when
    /// it completes so the user command never runs before it.
    fn spawn_clean_command(&self, cleaned_tx: oneshot::Sender<()>) {
        let client = self.client.clone();
        let namespace = self.dev.namespace.clone();
        let pod = self.pod.clone();
        let container = self.container.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let command = vec![
                String::from("sh"),
                String::from("-c"),
                String::from(CLEAN_COMMAND),
            ];
            if let Err(e) =
                exec::exec_once(&client, &namespace, &pod, &container, &command, "\n", &cancel).await
            {
                info!("first session to the remote container: {e}");
            }
            let _ = cleaned_tx.send(());
        });
    }

    /// Streams the user's command once the clean command finished.
    fn spawn_run_command(
        &self,
        cleaned_rx: oneshot::Receiver<()>,
        running_tx: mpsc::Sender<Result<()>>,
    ) {
        let client = self.client.clone();
        let namespace = self.dev.namespace.clone();
        let pod = self.pod.clone();
        let container = self.container.clone();
        let command = self.dev.command.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let _ = cleaned_rx.await;
            info!("starting remote command");
            let result =
                exec::exec_stream(&client, &namespace, &pod, &container, &command, &cancel).await;
            let _ = running_tx.send(result).await;
        });
    }

    /// Blocks until the command exits, the synchronization disconnects
    /// or a fatal error arrives. Warnings keep the session alive.
    async fn wait_until_exit(
        &self,
        running_rx: &mut mpsc::Receiver<Result<()>>,
        errors_rx: &mut mpsc::Receiver<String>,
        disconnect_rx: &mut mpsc::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                Some(result) = running_rx.recv() => {
                    eprintln!();
                    return match result {
                        Ok(()) => {
                            info!("command finished execution without any errors");
                            Ok(())
                        }
                        Err(e @ Error::CommandFailed { .. }) => {
                            info!("command execution error: {e}");
                            Err(e)
                        }
                        Err(e) => {
                            info!("command execution error: {e}");
                            Err(Error::CommandFailed { exit_code: 1 })
                        }
                    };
                }
                Some(message) = errors_rx.recv() => output::warning(&message),
                Some(()) = disconnect_rx.recv() => return Err(Error::LostConnection),
            }
        }
    }

    /// Runs the cancellation sequence, allowing each subsystem its
    /// shutdown budget. Failures are logged, never masking the exit
    /// cause.
    async fn shutdown(&mut self) {
        debug!("up shutdown");
        self.cancel.cancel();

        if self.dev.remote_mode_enabled() {
            if let Err(e) = ssh::remove_entry(&self.dev.name) {
                info!("failed to remove ssh entry: {e}");
            }
        }

        if let Some(mut syncthing) = self.syncthing.take() {
            info!("stopping syncthing");
            match tokio::time::timeout(SHUTDOWN_BUDGET * 2, syncthing.stop(false)).await {
                Ok(Err(e)) => info!("failed to stop syncthing during shutdown: {e}"),
                Err(_) => info!("syncthing did not stop within its shutdown budget"),
                Ok(Ok(())) => {}
            }
        }

        info!("stopping the forwarder");
        if let Some(mut forwarder) = self.forwarder.take() {
            forwarder.stop();
        }

        info!("completed shutdown sequence");
    }
}
