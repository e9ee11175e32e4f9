//! Per-connection protocols.
//!
//! ```text
//! Accepted -> IdentityReceived -> EndpointSession | ControllerSession -> Closed
//! ```
//!
//! Within one connection every step runs strictly in order. A channel error
//! ends the step that hit it and drops the affected connection from the
//! table; a bad request from a controller is answered with an error frame
//! and the session carries on.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::channel::{ChannelError, FramedChannel};
use crate::router::{ActiveConnection, Shared};
use crate::types::{Command, CommandKind, Identity, Role};
use crate::wire;

const ERROR_PREFIX: &[u8] = b"ERROR";

/// How long a controller waits for an endpoint channel held by someone else.
const ENDPOINT_LOCK_WAIT: Duration = Duration::from_secs(1);

/// Run one accepted connection to completion.
pub(crate) async fn run(stream: TcpStream, addr: SocketAddr, shared: &Shared) {
    let mut channel =
        FramedChannel::new(stream, addr.to_string()).with_max_frame_size(shared.max_frame_size);

    let Ok(first) = channel.receive().await else {
        return;
    };
    let identity = match wire::decode_identity(&first) {
        Ok(identity) => identity,
        Err(e) => {
            warn!("Protocol violation from {}: {}; closing", addr, e);
            channel.shutdown().await;
            return;
        }
    };
    info!(
        "Received connection information from {}: {}",
        addr, identity
    );

    if identity.role == Role::Unset {
        warn!("Connection from {} did not declare a role; closing", addr);
        channel.shutdown().await;
        return;
    }

    let connection = ActiveConnection {
        id: shared.next_connection_id(),
        identity,
        channel: Arc::new(Mutex::new(channel)),
        remote: addr,
    };
    let replaced = shared.connections.lock().await.insert(connection.clone());
    for stale in replaced {
        info!(
            "Endpoint {} reconnected from {}; dropping connection from {}",
            stale.identity.uuid, addr, stale.remote
        );
    }

    match connection.identity.role {
        Role::Endpoint => endpoint_session(&connection, shared).await,
        Role::Controller => controller_session(&connection, shared).await,
        Role::Unset => {}
    }
}

/// Reconcile the endpoint with the registry, then make one delivery pass
/// over the commands queued for it.
///
/// The connection stays in the table afterwards so controllers can relay
/// to it; commands queued later wait for the endpoint's next visit.
async fn endpoint_session(connection: &ActiveConnection, shared: &Shared) {
    let identity = &connection.identity;
    reconcile_identity(identity, shared).await;

    let batch = shared.queue.lock().await.take_for(&identity.uuid);
    let payload = match wire::encode_batch(&batch) {
        Ok(payload) => payload,
        Err(e) => {
            error!("Failed to encode batch for {}: {}", identity.uuid, e);
            shared.queue.lock().await.restore(batch);
            return;
        }
    };

    let mut channel = connection.channel.lock().await;
    if channel.send(&payload).await.is_err() {
        shared.queue.lock().await.restore(batch);
        drop(channel);
        shared.drop_connection(connection.id).await;
        return;
    }
    info!(
        "Delivered {} queued commands to {} ({})",
        batch.len(),
        identity.name,
        identity.uuid
    );

    let total = batch.len();
    for (index, command) in batch.iter().enumerate() {
        match deliver(&mut channel, command, shared).await {
            Ok(Delivery::Done) => {}
            Ok(Delivery::Abort) => {
                let remaining = total - index - 1;
                if remaining > 0 {
                    warn!(
                        "Abandoning {} remaining commands for {}",
                        remaining, identity.uuid
                    );
                }
                break;
            }
            Err(_) => {
                drop(channel);
                shared.drop_connection(connection.id).await;
                return;
            }
        }
    }
    debug!("Delivery pass for {} complete", identity.uuid);
}

async fn reconcile_identity(identity: &Identity, shared: &Shared) {
    let mut registry = shared.registry.lock().await;
    if registry.lookup(&identity.uuid).is_none() {
        if let Err(e) = registry.save(identity.clone()).await {
            error!("Failed to save identity {}: {}", identity.name, e);
        }
        return;
    }

    if registry.detect_mismatch(identity) {
        warn!(
            "Mismatched identity for {}, saving new information",
            identity.name
        );
        if let Err(e) = registry.delete(&identity.uuid).await {
            error!("Failed to delete identity {}: {}", identity.uuid, e);
        }
        if let Err(e) = registry.save(identity.clone()).await {
            error!("Failed to save identity {}: {}", identity.name, e);
        }
    }
}

enum Delivery {
    Done,
    /// The command failed here or on the endpoint; skip the rest of the
    /// batch. The endpoint stops at its first failure too.
    Abort,
}

async fn deliver(
    channel: &mut FramedChannel<TcpStream>,
    command: &Command,
    shared: &Shared,
) -> Result<Delivery, ChannelError> {
    let mut outcome = Delivery::Done;
    match command.kind {
        CommandKind::InstallModule => {
            match shared.modules.read(&command.module_file).await {
                Ok(bytes) => {
                    info!(
                        "Sending module {} ({} bytes, sha256 {})",
                        command.module_file,
                        bytes.len(),
                        hex::encode(Sha256::digest(&bytes))
                    );
                    channel.send(&bytes).await?;
                }
                Err(e) => {
                    error!("Failed to read module {}: {}", command.module_file, e);
                    channel.send(e.to_string().as_bytes()).await?;
                    outcome = Delivery::Abort;
                }
            }
            if !await_result(channel, command).await? {
                outcome = Delivery::Abort;
            }
        }
        CommandKind::DeleteModule => {
            if !await_result(channel, command).await? {
                outcome = Delivery::Abort;
            }
        }
        CommandKind::RunModule | CommandKind::NotSet => {
            debug!(
                "No result expected for command {} {}",
                command.kind, command.module_file
            );
        }
    }
    Ok(outcome)
}

/// Wait for the endpoint's status reply. Returns false if it reported an
/// error.
async fn await_result(
    channel: &mut FramedChannel<TcpStream>,
    command: &Command,
) -> Result<bool, ChannelError> {
    let result = channel.receive().await?;
    info!(
        "Received result for command {} {}: {}",
        command.kind,
        command.module_file,
        String::from_utf8_lossy(&result)
    );
    Ok(!result.starts_with(ERROR_PREFIX))
}

/// Send the activity log, then relay commands until the controller leaves.
async fn controller_session(connection: &ActiveConnection, shared: &Shared) {
    let mut controller = connection.channel.lock().await;

    let log_data = match shared.activity.read().await {
        Ok(data) => data,
        Err(e) => {
            error!("Failed to read activity log: {}", e);
            e.to_string().into_bytes()
        }
    };
    if controller.send(&log_data).await.is_err() {
        drop(controller);
        shared.drop_connection(connection.id).await;
        return;
    }

    loop {
        let Ok(frame) = controller.receive().await else {
            break;
        };

        let command = match wire::decode_command(&frame) {
            Ok(command) => command,
            Err(e) => {
                warn!("Invalid command from {}: {}", connection.remote, e);
                let reply = format!("ERROR: invalid command: {e}");
                if controller.send(reply.as_bytes()).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let target = shared.connections.lock().await.find_endpoint(&command.target);
        let Some(target) = target else {
            warn!("Unknown endpoint uuid: {}", command.target);
            let reply = format!("ERROR: unknown endpoint uuid {}", command.target);
            if controller.send(reply.as_bytes()).await.is_err() {
                break;
            }
            continue;
        };

        info!(
            "Relaying {} {} from {} to {}",
            command.kind, command.module_file, connection.identity.name, target.identity.name
        );
        if relay(&mut controller, &target, &command, shared).await.is_err() {
            break;
        }
    }

    drop(controller);
    shared.drop_connection(connection.id).await;
}

/// Forward `command` to the endpoint, then pass frames between the two
/// channels unchanged until one of them fails (or the relay sits idle for
/// the configured timeout).
///
/// Returns an error only when the controller's channel fails. When the
/// endpoint's channel fails the endpoint is dropped, the controller is told,
/// and the controller session continues.
async fn relay(
    controller: &mut FramedChannel<TcpStream>,
    target: &ActiveConnection,
    command: &Command,
    shared: &Shared,
) -> Result<(), ChannelError> {
    let payload = match wire::encode_command(command) {
        Ok(payload) => payload,
        Err(e) => {
            error!("Failed to encode command: {}", e);
            return controller
                .send(format!("ERROR: {e}").as_bytes())
                .await;
        }
    };

    // Another controller's relay (or the endpoint's own delivery pass) may
    // hold the channel indefinitely.
    let Ok(mut endpoint) = timeout(ENDPOINT_LOCK_WAIT, target.channel.lock()).await else {
        warn!(
            "Endpoint {} busy; not relaying {} {}",
            target.identity.uuid, command.kind, command.module_file
        );
        let reply = format!("ERROR: endpoint {} busy", target.identity.uuid);
        return controller.send(reply.as_bytes()).await;
    };
    if endpoint.send(&payload).await.is_ok() {
        loop {
            // Both receives are cancel-safe, so losing the race drops nothing.
            let event = tokio::select! {
                received = endpoint.receive() => RelayEvent::FromEndpoint(received),
                received = controller.receive() => RelayEvent::FromController(received),
                _ = idle(shared.relay_idle_timeout) => RelayEvent::Idle,
            };

            match event {
                RelayEvent::FromEndpoint(Ok(frame)) => controller.send(&frame).await?,
                RelayEvent::FromEndpoint(Err(_)) => break,
                RelayEvent::FromController(received) => {
                    let frame = received?;
                    if endpoint.send(&frame).await.is_err() {
                        break;
                    }
                }
                RelayEvent::Idle => {
                    info!(
                        "Relay to {} idle; returning to controller",
                        target.identity.uuid
                    );
                    return Ok(());
                }
            }
        }
    }

    drop(endpoint);
    shared.drop_connection(target.id).await;
    let reply = format!("ERROR: lost connection to endpoint {}", target.identity.uuid);
    controller.send(reply.as_bytes()).await
}

enum RelayEvent {
    FromEndpoint(Result<Vec<u8>, ChannelError>),
    FromController(Result<Vec<u8>, ChannelError>),
    Idle,
}

async fn idle(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}
