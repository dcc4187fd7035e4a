use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SwimError};

#[derive(PartialEq, Eq, Debug, Clone)]
pub struct InboundMessage {
    pub bytes: Bytes,
    pub sender_address: SocketAddr,
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub struct OutboundMessage {
    pub content: Bytes,
    pub target_address: SocketAddr,
}

/// Fire-and-forget datagram send. Delivery is never confirmed.
pub trait NetworkClient: Send + Sync {
    fn send(&self, message: OutboundMessage) -> Result<()>;
}

/// Receives datagrams on `socket` and forwards them to `sender` until
/// `cancellation_token` is cancelled or the receiving side goes away.
pub async fn start_udp_server(cancellation_token: CancellationToken,
                              socket: Arc<UdpSocket>,
                              sender: UnboundedSender<InboundMessage>,
                              max_datagram_size: usize) -> anyhow::Result<()> {
    let result = tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => {
                Ok(())
            }
            result = process_incoming_request(socket, sender, max_datagram_size) => {
                result
            }
        }
    }).await?;
    return result;
}

async fn process_incoming_request(socket: Arc<UdpSocket>,
                                  sender: UnboundedSender<InboundMessage>,
                                  max_datagram_size: usize) -> anyhow::Result<()> {
    log::info!("UDP server listening on {}", socket.local_addr()?);
    let mut buf = vec![0u8; max_datagram_size];
    loop {
        let (len, socket_address) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                log::warn!("Receive failed: {}", err);
                continue;
            }
        };
        log::debug!("Receive msg with len {} from {}", len, socket_address);
        let message = InboundMessage { bytes: Bytes::copy_from_slice(&buf[..len]), sender_address: socket_address };
        if sender.send(message).is_err() {
            log::debug!("Inbound channel closed, UDP server stops");
            return Ok(());
        }
    }
}

/// Queues datagrams for a writer task that owns the send side of the
/// listening socket, so peers see the well-known port as source.
pub struct UdpNetworkClient {
    outbound: UnboundedSender<OutboundMessage>,
}

impl UdpNetworkClient {
    pub fn spawn(socket: Arc<UdpSocket>, cancellation_token: CancellationToken) -> UdpNetworkClient {
        let (outbound, mut queue) = mpsc::unbounded_channel::<OutboundMessage>();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    _ = cancellation_token.cancelled() => break,
                    message = queue.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                match socket.send_to(message.content.as_ref(), message.target_address).await {
                    Ok(sent) => log::debug!("Send {} of {} bytes to {}", sent, message.content.len(), message.target_address),
                    Err(err) => log::warn!("{}", SwimError::Unreachable { addr: message.target_address, reason: err.to_string() }),
                }
            }
            log::debug!("UDP writer stopped");
        });
        UdpNetworkClient { outbound }
    }
}

impl NetworkClient for UdpNetworkClient {
    fn send(&self, message: OutboundMessage) -> Result<()> {
        let addr = message.target_address;
        self.outbound
            .send(message)
            .map_err(|_| SwimError::Unreachable { addr, reason: "writer stopped".to_string() })
    }
}

/// Loopback transport: every address maps to the inbound channel of a
/// service running in the same process.
pub struct InMemoryNetworkClient {
    channels: HashMap<SocketAddr, UnboundedSender<InboundMessage>>,
    local_address: SocketAddr,
}

impl InMemoryNetworkClient {
    pub fn new(channels: HashMap<SocketAddr, UnboundedSender<InboundMessage>>,
               local_address: SocketAddr) -> InMemoryNetworkClient {
        InMemoryNetworkClient { channels, local_address }
    }
}

impl NetworkClient for InMemoryNetworkClient {
    fn send(&self, message: OutboundMessage) -> Result<()> {
        let unreachable = |reason: &str| SwimError::Unreachable {
            addr: message.target_address,
            reason: reason.to_string(),
        };
        let channel = self.channels
            .get(&message.target_address)
            .ok_or_else(|| unreachable("no such address"))?;
        channel
            .send(InboundMessage { bytes: message.content.clone(), sender_address: self.local_address })
            .map_err(|_| unreachable("receiver closed"))
    }
}

/// Local IPv4 address used for outbound traffic. Connecting a UDP socket
/// sends nothing; it only makes the kernel pick a route.
pub fn local_ipv4() -> anyhow::Result<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").context("bind probe socket")?;
    socket.connect("8.8.8.8:80").context("route probe")?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(ip) => anyhow::bail!("expected an IPv4 address, got {}", ip),
    }
}
