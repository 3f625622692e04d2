//! UDP socket shared by SIP and STUN

use super::message::SipError;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Datagram read from the socket
#[derive(Debug, Clone)]
pub struct IncomingDatagram {
    pub data: Bytes,
    pub source: SocketAddr,
}

/// Transport layer trait
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    fn local_addr(&self) -> SocketAddr;

    async fn send(&self, data: &[u8], destination: SocketAddr) -> Result<(), SipError>;

    /// Get the receiver for incoming datagrams
    fn receiver(&mut self) -> &mut mpsc::Receiver<IncomingDatagram>;
}

/// UDP transport implementation
pub struct UdpTransport {
    local_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    rx: mpsc::Receiver<IncomingDatagram>,
}

impl UdpTransport {
    /// Bind and start reading in the background
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self, SipError> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket: {}", e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| SipError::TransportError(format!("Failed to read local address: {}", e)))?;
        info!("UDP transport listening on {}", local_addr);

        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::channel(1000);
        let reader = socket.clone();
        tokio::spawn(async move {
            Self::receive_loop(reader, tx).await;
        });

        Ok(Self {
            local_addr,
            socket,
            rx,
        })
    }

    async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<IncomingDatagram>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    debug!("Received {} bytes from {} via UDP", size, source);
                    let incoming = IncomingDatagram {
                        data: Bytes::copy_from_slice(&buf[..size]),
                        source,
                    };
                    if tx.send(incoming).await.is_err() {
                        debug!("Receiver dropped, stopping UDP receive loop");
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to receive UDP packet: {}", e);
                    break;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send(&self, data: &[u8], destination: SocketAddr) -> Result<(), SipError> {
        debug!("Sending {} bytes to {} via UDP", data.len(), destination);
        self.socket
            .send_to(data, destination)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;
        Ok(())
    }

    fn receiver(&mut self) -> &mut mpsc::Receiver<IncomingDatagram> {
        &mut self.rx
    }
}
