//! Runnable units, the pluggable work an endpoint executes.
//!
//! Units are registered explicitly in a [`UnitRegistry`] under a module
//! identifier. Each unit declares what it needs ([`Requirement`]) and the
//! registry hands exactly those dependencies to [`RunnableUnit::start`].

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::net::TcpStream;

use crate::channel::{ChannelError, FramedChannel};

pub mod echo;
pub use echo::EchoUnit;

/// Dependencies a unit can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// The endpoint's connection to the router.
    Channel,
    /// A log target to write records under.
    Logger,
}

/// When an endpoint starts a unit on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Startup {
    /// Only when a RunModule command names it.
    Manual,
    /// Once, when the endpoint process starts.
    OnStart,
    /// Every time the endpoint (re)connects to the router.
    OnConnect,
}

#[derive(Debug, Error)]
pub enum UnitError {
    #[error("Unknown module: {0}")]
    UnknownUnit(String),
    #[error("Module {unit} requires {requirement:?} but none was provided")]
    MissingRequirement {
        unit: String,
        requirement: Requirement,
    },
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("{0}")]
    Failed(String),
}

/// What a unit receives when started. Only the declared requirements are
/// populated.
pub struct UnitContext<'a> {
    pub channel: Option<&'a mut FramedChannel<TcpStream>>,
    pub log_target: Option<String>,
}

#[async_trait]
pub trait RunnableUnit: Send {
    fn startup(&self) -> Startup;

    fn requirements(&self) -> &[Requirement];

    /// Run the unit to completion.
    async fn start(&mut self, ctx: UnitContext<'_>) -> Result<(), UnitError>;
}

pub type UnitFactory = fn() -> Box<dyn RunnableUnit>;

/// Static map from module identifier to unit factory.
#[derive(Clone, Default)]
pub struct UnitRegistry {
    factories: BTreeMap<String, UnitFactory>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the units that ship with the crate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("echo", || Box::new(EchoUnit::new()));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: UnitFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Identifiers of the units with the given startup policy.
    pub fn with_startup(&self, startup: Startup) -> Vec<String> {
        self.factories
            .iter()
            .filter(|(_, factory)| factory().startup() == startup)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Build a fresh unit. `module` may carry a file extension
    /// (`echo.bin` resolves to `echo`).
    pub fn resolve(&self, module: &str) -> Result<Box<dyn RunnableUnit>, UnitError> {
        let name = Path::new(module)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(module);
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| UnitError::UnknownUnit(module.to_string()))
    }

    /// Resolve `module`, inject its requirements and run it.
    pub async fn launch(
        &self,
        module: &str,
        channel: Option<&mut FramedChannel<TcpStream>>,
    ) -> Result<(), UnitError> {
        let mut unit = self.resolve(module)?;
        let mut ctx = UnitContext {
            channel: None,
            log_target: None,
        };
        let mut channel = channel;

        for requirement in unit.requirements() {
            match requirement {
                Requirement::Channel => {
                    debug!("Linking channel to module {}", module);
                    ctx.channel = Some(channel.take().ok_or_else(|| {
                        UnitError::MissingRequirement {
                            unit: module.to_string(),
                            requirement: Requirement::Channel,
                        }
                    })?);
                }
                Requirement::Logger => {
                    debug!("Linking logger to module {}", module);
                    ctx.log_target = Some(format!("tether::unit::{module}"));
                }
            }
        }

        debug!("Starting module {}", module);
        unit.start(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Idle;

    #[async_trait]
    impl RunnableUnit for Idle {
        fn startup(&self) -> Startup {
            Startup::OnStart
        }

        fn requirements(&self) -> &[Requirement] {
            &[]
        }

        async fn start(&mut self, ctx: UnitContext<'_>) -> Result<(), UnitError> {
            assert!(ctx.channel.is_none());
            assert!(ctx.log_target.is_none());
            Ok(())
        }
    }

    #[test]
    fn test_builtins() {
        let registry = UnitRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["echo"]);
        assert!(registry.resolve("echo").is_ok());
        assert!(registry.resolve("echo.bin").is_ok());
    }

    #[test]
    fn test_unknown_unit() {
        let registry = UnitRegistry::with_builtins();
        assert!(matches!(
            registry.resolve("nonexistent"),
            Err(UnitError::UnknownUnit(name)) if name == "nonexistent"
        ));
    }

    #[test]
    fn test_startup_filter() {
        let mut registry = UnitRegistry::with_builtins();
        registry.register("idle", || Box::new(Idle));
        assert_eq!(registry.with_startup(Startup::OnStart), vec!["idle"]);
        assert_eq!(registry.with_startup(Startup::Manual), vec!["echo"]);
        assert!(registry.with_startup(Startup::OnConnect).is_empty());
    }

    #[tokio::test]
    async fn test_launch_without_requirements() {
        let mut registry = UnitRegistry::new();
        registry.register("idle", || Box::new(Idle));
        registry.launch("idle", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_channel_requirement() {
        let registry = UnitRegistry::with_builtins();
        match registry.launch("echo", None).await {
            Err(UnitError::MissingRequirement { unit, requirement }) => {
                assert_eq!(unit, "echo");
                assert_eq!(requirement, Requirement::Channel);
            }
            other => panic!("Expected MissingRequirement, got {other:?}"),
        }
    }
}
