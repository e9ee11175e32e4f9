use async_trait::async_trait;
use log::info;

use super::{Requirement, RunnableUnit, Startup, UnitContext, UnitError};

/// Sends every frame it receives straight back until it receives `exit`.
pub struct EchoUnit;

impl EchoUnit {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EchoUnit {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunnableUnit for EchoUnit {
    fn startup(&self) -> Startup {
        Startup::Manual
    }

    fn requirements(&self) -> &[Requirement] {
        &[Requirement::Channel, Requirement::Logger]
    }

    async fn start(&mut self, ctx: UnitContext<'_>) -> Result<(), UnitError> {
        let channel = ctx.channel.ok_or_else(|| UnitError::MissingRequirement {
            unit: "echo".into(),
            requirement: Requirement::Channel,
        })?;
        let target = ctx.log_target.unwrap_or_else(|| module_path!().to_string());

        loop {
            let frame = channel.receive().await?;
            if frame == b"exit" {
                info!(target: target.as_str(), "Echo finished");
                return Ok(());
            }
            info!(target: target.as_str(), "Echoing {} bytes", frame.len());
            channel.send(&frame).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::FramedChannel;
    use crate::unit::UnitRegistry;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_echo_until_exit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let unit_side = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let mut channel = FramedChannel::new(stream, peer.to_string());
            UnitRegistry::with_builtins()
                .launch("echo", Some(&mut channel))
                .await
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut peer = FramedChannel::new(stream, addr.to_string());
        peer.send(b"ping").await.unwrap();
        assert_eq!(peer.receive().await.unwrap(), b"ping");
        peer.send(b"").await.unwrap();
        assert_eq!(peer.receive().await.unwrap(), b"");
        peer.send(b"exit").await.unwrap();

        unit_side.await.unwrap().unwrap();
    }
}
