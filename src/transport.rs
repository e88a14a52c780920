//! The datagram transport consumed by the protocol engine, introduced as a
//!  trait to facilitate mocking the I/O part away for testing. The engine
//!  only ever talks to one peer per stream, so the production implementation
//!  uses a connected UDP socket.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{debug, info};

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send {
    /// Resolve the peer and bind the local socket, bounded by the
    ///  implementation's connect timeout.
    async fn connect(&mut self, host: &str, port: u16) -> anyhow::Result<()>;

    async fn disconnect(&mut self) -> anyhow::Result<()>;

    /// Hand one datagram to the network. Returns the number of bytes written.
    async fn write(&mut self, buf: &[u8]) -> anyhow::Result<usize>;

    /// Whether at least one datagram is ready to be read without waiting.
    fn has_pending_datagrams(&self) -> bool;

    /// Read one pending datagram into `buf`, returning its length.
    async fn read_datagram(&mut self, buf: &mut [u8]) -> anyhow::Result<usize>;
}

pub struct UdpTransport {
    socket: Option<UdpSocket>,
    connect_timeout: Duration,
}

impl UdpTransport {
    pub fn new(connect_timeout: Duration) -> UdpTransport {
        UdpTransport {
            socket: None,
            connect_timeout,
        }
    }

    fn socket(&self) -> anyhow::Result<&UdpSocket> {
        self.socket.as_ref().context("transport is not connected")
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn connect(&mut self, host: &str, port: u16) -> anyhow::Result<()> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;

        tokio::time::timeout(self.connect_timeout, socket.connect((host, port)))
            .await
            .with_context(|| format!("timeout connecting to {}:{}", host, port))?
            .with_context(|| format!("cannot connect to {}:{}", host, port))?;

        info!("connected UDP transport to {}:{}", host, port);
        self.socket = Some(socket);
        Ok(())
    }

    async fn disconnect(&mut self) -> anyhow::Result<()> {
        if self.socket.take().is_some() {
            info!("disconnected UDP transport");
        }
        else {
            debug!("disconnect on a transport that was not connected");
        }
        Ok(())
    }

    async fn write(&mut self, buf: &[u8]) -> anyhow::Result<usize> {
        Ok(self.socket()?.send(buf).await?)
    }

    fn has_pending_datagrams(&self) -> bool {
        match &self.socket {
            Some(socket) => socket.try_peek_sender().is_ok(),
            None => false,
        }
    }

    async fn read_datagram(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        Ok(self.socket()?.recv(buf).await?)
    }
}
