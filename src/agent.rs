//! Endpoint side of the router protocol.
//!
//! An [`EndpointAgent`] identifies itself, applies the batch of commands the
//! router queued for it, then serves commands relayed live by controllers.
//! Every InstallModule and DeleteModule is answered with one status frame:
//! `OK` or `ERROR: <reason>`.
//!
//! [`EndpointAgent::run`] is the whole lifecycle: start the `OnStart` units
//! once, then connect, apply the batch, start the `OnConnect` units and
//! serve live commands, reconnecting after every failure.

use std::net::SocketAddr;
use std::time::Duration;

use log::{error, info, warn};

use crate::client::{ClientError, RelayClient};
use crate::module_store::ModuleStore;
use crate::types::{Command, CommandKind, Identity};
use crate::unit::{Startup, UnitRegistry};
use crate::wire;

pub const STATUS_OK: &[u8] = b"OK";

/// Pause between connection attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// What happened to a queued batch.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Commands applied successfully, in order.
    pub applied: Vec<Command>,
    /// The command that failed and why. Commands after it were not applied.
    pub failed: Option<(Command, String)>,
    /// RunModule commands, which are only run when relayed live.
    pub skipped: Vec<Command>,
}

pub struct EndpointAgent {
    identity: Identity,
    modules: ModuleStore,
    units: UnitRegistry,
}

impl EndpointAgent {
    pub fn new(identity: Identity, modules: ModuleStore, units: UnitRegistry) -> Self {
        Self {
            identity,
            modules,
            units,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Run forever: `OnStart` units once, then one router session after
    /// another, sleeping `reconnect_delay` after each connect failure or
    /// lost connection.
    pub async fn run(&self, addr: SocketAddr, reconnect_delay: Duration) {
        self.start_units(Startup::OnStart, None).await;
        loop {
            match RelayClient::connect(addr).await {
                Ok(mut client) => {
                    if let Err(e) = self.connected(&mut client).await {
                        warn!("Lost connection to router {}: {}", addr, e);
                    }
                }
                Err(e) => warn!("{}", e),
            }
            tokio::time::sleep(reconnect_delay).await;
        }
    }

    async fn connected(&self, client: &mut RelayClient) -> Result<(), ClientError> {
        let report = self.run_session(client).await?;
        if let Some((command, reason)) = &report.failed {
            warn!(
                "Batch stopped at {} {}: {}",
                command.kind, command.module_file, reason
            );
        }
        self.start_units(Startup::OnConnect, Some(client)).await;
        self.serve_live(client).await
    }

    /// Start every registered unit with the given startup policy, one after
    /// another, handing each the router connection if there is one.
    /// Returns the identifiers of the units that ran successfully.
    pub async fn start_units(
        &self,
        startup: Startup,
        mut client: Option<&mut RelayClient>,
    ) -> Vec<String> {
        let mut completed = Vec::new();
        for name in self.units.with_startup(startup) {
            let channel = client.as_deref_mut().map(RelayClient::channel_mut);
            match self.units.launch(&name, channel).await {
                Ok(()) => {
                    info!("Unit {} finished", name);
                    completed.push(name);
                }
                Err(e) => error!("Error running unit {}: {}", name, e),
            }
        }
        completed
    }

    /// Identify and apply the queued batch.
    pub async fn run_session(&self, client: &mut RelayClient) -> Result<BatchReport, ClientError> {
        client.identify(&self.identity).await?;
        let batch = client.receive_batch().await?;
        let mut report = BatchReport::default();

        for command in batch {
            info!("Received command {} {}", command.kind, command.module_file);
            let outcome = match command.kind {
                CommandKind::InstallModule => self.install(client, &command).await?,
                CommandKind::DeleteModule => self.delete(client, &command).await?,
                CommandKind::RunModule | CommandKind::NotSet => {
                    report.skipped.push(command);
                    continue;
                }
            };
            match outcome {
                Ok(()) => report.applied.push(command),
                Err(reason) => {
                    report.failed = Some((command, reason));
                    break;
                }
            }
        }
        Ok(report)
    }

    /// Serve live commands until the connection drops.
    pub async fn serve_live(&self, client: &mut RelayClient) -> Result<(), ClientError> {
        loop {
            let frame = client.receive_frame().await?;
            let command = match wire::decode_command(&frame) {
                Ok(command) => command,
                Err(e) => {
                    warn!("Ignoring frame that is not a command: {}", e);
                    client
                        .send_frame(format!("ERROR: {e}").as_bytes())
                        .await?;
                    continue;
                }
            };

            match command.kind {
                CommandKind::InstallModule => {
                    self.install(client, &command).await?;
                }
                CommandKind::DeleteModule => {
                    self.delete(client, &command).await?;
                }
                CommandKind::RunModule => {
                    let reply = match self
                        .units
                        .launch(&command.module_file, Some(client.channel_mut()))
                        .await
                    {
                        Ok(()) => {
                            info!("Ran module {}", command.module_file);
                            STATUS_OK.to_vec()
                        }
                        Err(e) => {
                            error!("Error running module {}: {}", command.module_file, e);
                            format!("ERROR: {e}").into_bytes()
                        }
                    };
                    client.send_frame(&reply).await?;
                }
                CommandKind::NotSet => {
                    client.send_frame(b"ERROR: command kind not set").await?;
                }
            }
        }
    }

    /// Receive the module bytes and store them. The outer result is the
    /// connection, the inner one the local outcome (already reported).
    async fn install(
        &self,
        client: &mut RelayClient,
        command: &Command,
    ) -> Result<Result<(), String>, ClientError> {
        let bytes = client.receive_frame().await?;
        let outcome = match self.modules.write(&command.module_file, &bytes).await {
            Ok(()) => {
                info!("Installed module {}", command.module_file);
                Ok(())
            }
            Err(e) => {
                error!("Error installing module {}: {}", command.module_file, e);
                Err(e.to_string())
            }
        };
        self.report(client, &outcome).await?;
        Ok(outcome)
    }

    async fn delete(
        &self,
        client: &mut RelayClient,
        command: &Command,
    ) -> Result<Result<(), String>, ClientError> {
        let outcome = match self.modules.remove(&command.module_file).await {
            Ok(()) => {
                info!("Deleted module {}", command.module_file);
                Ok(())
            }
            Err(e) => {
                error!("Error deleting module {}: {}", command.module_file, e);
                Err(e.to_string())
            }
        };
        self.report(client, &outcome).await?;
        Ok(outcome)
    }

    async fn report(
        &self,
        client: &mut RelayClient,
        outcome: &Result<(), String>,
    ) -> Result<(), ClientError> {
        match outcome {
            Ok(()) => client.send_frame(STATUS_OK).await,
            Err(reason) => {
                client
                    .send_frame(format!("ERROR: {reason}").as_bytes())
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::FramedChannel;
    use crate::types::Role;
    use crate::unit::{Requirement, RunnableUnit, UnitContext, UnitError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::net::{TcpListener, TcpStream};

    static ON_START_RUNS: AtomicUsize = AtomicUsize::new(0);
    static ON_CONNECT_RUNS: AtomicUsize = AtomicUsize::new(0);

    /// Counts its runs; says hello over the channel when it has one.
    struct Counter {
        startup: Startup,
        runs: &'static AtomicUsize,
    }

    #[async_trait]
    impl RunnableUnit for Counter {
        fn startup(&self) -> Startup {
            self.startup
        }

        fn requirements(&self) -> &[Requirement] {
            const WITH_CHANNEL: &[Requirement] = &[Requirement::Channel];
            const NONE: &[Requirement] = &[];
            match self.startup {
                Startup::OnConnect => WITH_CHANNEL,
                _ => NONE,
            }
        }

        async fn start(&mut self, ctx: UnitContext<'_>) -> Result<(), UnitError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if let Some(channel) = ctx.channel {
                channel.send(b"hello from unit").await?;
            }
            Ok(())
        }
    }

    fn counting_units() -> UnitRegistry {
        let mut units = UnitRegistry::with_builtins();
        units.register("boot", || {
            Box::new(Counter {
                startup: Startup::OnStart,
                runs: &ON_START_RUNS,
            })
        });
        units.register("greeter", || {
            Box::new(Counter {
                startup: Startup::OnConnect,
                runs: &ON_CONNECT_RUNS,
            })
        });
        units
    }

    fn agent(dir: &TempDir, units: UnitRegistry) -> EndpointAgent {
        EndpointAgent::new(
            Identity::new("host", "ops", Role::Endpoint, "1.0", "ep-1"),
            ModuleStore::new(dir.path()),
            units,
        )
    }

    /// A connected (agent client, router side) pair.
    async fn pair() -> (RelayClient, FramedChannel<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = RelayClient::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, addr) = listener.accept().await.unwrap();
        (client, FramedChannel::new(server, addr.to_string()))
    }

    #[tokio::test]
    async fn test_failed_command_stops_batch() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("keep.bin"), b"keep").unwrap();
        let agent = agent(&dir, UnitRegistry::with_builtins());
        let (mut client, mut router) = pair().await;

        let missing = Command::new(CommandKind::DeleteModule, "missing.bin", "ep-1");
        let keep = Command::new(CommandKind::DeleteModule, "keep.bin", "ep-1");
        let router_side = tokio::spawn(async move {
            let identity = wire::decode_identity(&router.receive().await.unwrap()).unwrap();
            assert_eq!(identity.uuid, "ep-1");
            let batch = vec![missing, keep];
            router
                .send(&wire::encode_batch(&batch).unwrap())
                .await
                .unwrap();
            let reply = router.receive().await.unwrap();
            // The agent hangs up after one reply.
            let after = router.receive().await;
            (reply, after.is_err())
        });

        let report = agent.run_session(&mut client).await.unwrap();
        drop(client);
        let (reply, closed_after_one) = router_side.await.unwrap();

        assert!(String::from_utf8_lossy(&reply).starts_with("ERROR: "));
        assert!(closed_after_one);
        assert!(report.applied.is_empty());
        let (failed, reason) = report.failed.unwrap();
        assert_eq!(failed.module_file, "missing.bin");
        assert!(!reason.is_empty());
        assert!(dir.path().join("keep.bin").exists());
    }

    #[tokio::test]
    async fn test_live_unknown_unit_reports_error() {
        let dir = TempDir::new().unwrap();
        let agent = agent(&dir, UnitRegistry::with_builtins());
        let (mut client, mut router) = pair().await;
        let serving = tokio::spawn(async move { agent.serve_live(&mut client).await });

        let run = Command::new(CommandKind::RunModule, "nope", "ep-1");
        router
            .send(&wire::encode_command(&run).unwrap())
            .await
            .unwrap();
        let reply = router.receive().await.unwrap();
        assert!(String::from_utf8_lossy(&reply).starts_with("ERROR: Unknown module: nope"));

        let unset = Command::new(CommandKind::NotSet, "x", "ep-1");
        router
            .send(&wire::encode_command(&unset).unwrap())
            .await
            .unwrap();
        assert_eq!(
            router.receive().await.unwrap(),
            b"ERROR: command kind not set"
        );

        router.send(b"not a command").await.unwrap();
        let reply = router.receive().await.unwrap();
        assert!(reply.starts_with(b"ERROR: "));

        drop(router);
        assert!(serving.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_live_install_writes_module() {
        let dir = TempDir::new().unwrap();
        let agent = agent(&dir, UnitRegistry::with_builtins());
        let (mut client, mut router) = pair().await;
        let serving = tokio::spawn(async move { agent.serve_live(&mut client).await });

        let install = Command::new(CommandKind::InstallModule, "fresh.bin", "ep-1");
        router
            .send(&wire::encode_command(&install).unwrap())
            .await
            .unwrap();
        router.send(b"module bytes").await.unwrap();
        assert_eq!(router.receive().await.unwrap(), STATUS_OK);
        assert_eq!(
            std::fs::read(dir.path().join("fresh.bin")).unwrap(),
            b"module bytes"
        );

        drop(router);
        let _ = serving.await;
    }

    #[tokio::test]
    async fn test_run_starts_units_and_reconnects() {
        let dir = TempDir::new().unwrap();
        let agent = agent(&dir, counting_units());

        // Nothing listens yet: the agent has to retry.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let running = tokio::spawn(async move {
            agent.run(addr, Duration::from_millis(50)).await;
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ON_START_RUNS.load(Ordering::SeqCst), 1);
        assert_eq!(ON_CONNECT_RUNS.load(Ordering::SeqCst), 0);

        let listener = TcpListener::bind(addr).await.unwrap();
        for visit in 1..=2 {
            let (stream, peer) = listener.accept().await.unwrap();
            let mut router = FramedChannel::new(stream, peer.to_string());
            let identity = wire::decode_identity(&router.receive().await.unwrap()).unwrap();
            assert_eq!(identity.uuid, "ep-1");
            router.send(&wire::encode_batch(&[]).unwrap()).await.unwrap();
            assert_eq!(router.receive().await.unwrap(), b"hello from unit");
            assert_eq!(ON_CONNECT_RUNS.load(Ordering::SeqCst), visit);
            // Hang up; the agent should come back.
        }

        assert_eq!(ON_START_RUNS.load(Ordering::SeqCst), 1);
        running.abort();
    }

    #[tokio::test]
    async fn test_start_units_without_channel() {
        let dir = TempDir::new().unwrap();
        let mut units = UnitRegistry::new();
        units.register("greeter", || {
            Box::new(Counter {
                startup: Startup::OnConnect,
                runs: &ON_CONNECT_RUNS_NO_CHANNEL,
            })
        });
        let agent = agent(&dir, units);

        // The unit needs a channel, so it is refused rather than started.
        let completed = agent.start_units(Startup::OnConnect, None).await;
        assert!(completed.is_empty());
        assert_eq!(ON_CONNECT_RUNS_NO_CHANNEL.load(Ordering::SeqCst), 0);
        assert!(agent.start_units(Startup::OnStart, None).await.is_empty());
    }

    static ON_CONNECT_RUNS_NO_CHANNEL: AtomicUsize = AtomicUsize::new(0);
}
