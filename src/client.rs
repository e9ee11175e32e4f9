//! Remote side of the router protocol.
//!
//! [`RelayClient`] is what endpoint and controller programs use to talk to
//! the router. It frames traffic with the same [`FramedChannel`] the router
//! uses.

use std::net::SocketAddr;

use log::info;
use thiserror::Error;
use tokio::net::TcpStream;

use crate::channel::{ChannelError, FramedChannel};
use crate::types::{Command, Identity};
use crate::wire::{self, WireError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Wire(#[from] WireError),
}

pub struct RelayClient {
    channel: FramedChannel<TcpStream>,
    addr: SocketAddr,
}

impl RelayClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::Connect { addr, source })?;
        info!("Connected to {}", addr);
        Ok(Self {
            channel: FramedChannel::new(stream, addr.to_string()),
            addr,
        })
    }

    /// The underlying channel, for units that take over the connection.
    pub fn channel_mut(&mut self) -> &mut FramedChannel<TcpStream> {
        &mut self.channel
    }

    /// Announce who we are. Must be the first frame on the connection.
    pub async fn identify(&mut self, identity: &Identity) -> Result<(), ClientError> {
        let payload = wire::encode_identity(identity)?;
        self.channel.send(&payload).await?;
        Ok(())
    }

    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<(), ClientError> {
        Ok(self.channel.send(payload).await?)
    }

    pub async fn receive_frame(&mut self) -> Result<Vec<u8>, ClientError> {
        Ok(self.channel.receive().await?)
    }

    pub async fn send_command(&mut self, command: &Command) -> Result<(), ClientError> {
        let payload = wire::encode_command(command)?;
        self.send_frame(&payload).await
    }

    pub async fn receive_command(&mut self) -> Result<Command, ClientError> {
        let frame = self.receive_frame().await?;
        Ok(wire::decode_command(&frame)?)
    }

    pub async fn receive_batch(&mut self) -> Result<Vec<Command>, ClientError> {
        let frame = self.receive_frame().await?;
        Ok(wire::decode_batch(&frame)?)
    }

    pub async fn disconnect(mut self) {
        self.channel.shutdown().await;
        info!("Disconnected from {}", self.addr);
    }
}
