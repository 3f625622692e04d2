//! Async driver for [`SipClient`]
//!
//! The user agent task owns the socket and the client. It feeds datagrams,
//! DNS answers, commands and timer ticks into the client and sends out
//! whatever the client queues. Applications talk to it through a cloneable
//! [`UserAgentHandle`] and receive [`ClientEvent`]s from a broadcast channel.

use super::client::{ClientConfig, LookupKind, LookupRequest, SessionFactory, SipClient, SrvRecord};
use super::dns::Resolver;
use super::message::SipError;
use super::transport::{IncomingDatagram, Transport};
use crate::domain::{ClientError, ClientEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Requests from the application to the user agent task
#[derive(Debug)]
pub enum Command {
    Connect,
    Disconnect,
    Call {
        recipient: String,
        reply: oneshot::Sender<Result<String, ClientError>>,
    },
    Accept {
        call_id: String,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Hangup {
        call_id: String,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    LocalCandidatesChanged {
        call_id: String,
    },
    Shutdown,
}

#[derive(Debug)]
enum LookupResult {
    Srv(LookupKind, Vec<SrvRecord>),
    Host(LookupKind, Option<SocketAddr>),
}

enum Input {
    Datagram(Option<IncomingDatagram>),
    Command(Option<Command>),
    Lookup(Option<LookupResult>),
    Timeout,
}

#[derive(Clone)]
pub struct UserAgentHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ClientEvent>,
}

impl UserAgentHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    async fn send(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::InvalidState("user agent stopped".to_string()))
    }

    async fn request<T>(
        &self,
        command: Command,
        reply: oneshot::Receiver<Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        self.send(command).await?;
        reply
            .await
            .map_err(|_| ClientError::InvalidState("user agent stopped".to_string()))?
    }

    pub async fn connect(&self) -> Result<(), ClientError> {
        self.send(Command::Connect).await
    }

    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.send(Command::Disconnect).await
    }

    pub async fn call(&self, recipient: &str) -> Result<String, ClientError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Call {
            recipient: recipient.to_string(),
            reply,
        };
        self.request(command, rx).await
    }

    pub async fn accept(&self, call_id: &str) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Accept {
            call_id: call_id.to_string(),
            reply,
        };
        self.request(command, rx).await
    }

    pub async fn hangup(&self, call_id: &str) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Hangup {
            call_id: call_id.to_string(),
            reply,
        };
        self.request(command, rx).await
    }

    pub async fn local_candidates_changed(&self, call_id: &str) -> Result<(), ClientError> {
        self.send(Command::LocalCandidatesChanged {
            call_id: call_id.to_string(),
        })
        .await
    }

    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.send(Command::Shutdown).await
    }
}

pub struct UserAgent<T: Transport, R: Resolver + 'static> {
    client: SipClient,
    transport: T,
    resolver: Arc<R>,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<ClientEvent>,
    lookup_tx: mpsc::UnboundedSender<LookupResult>,
    lookup_rx: mpsc::UnboundedReceiver<LookupResult>,
}

impl<T: Transport, R: Resolver + 'static> UserAgent<T, R> {
    pub fn new(
        config: ClientConfig,
        transport: T,
        resolver: R,
        factory: Box<dyn SessionFactory>,
    ) -> (Self, UserAgentHandle) {
        let client = SipClient::new(config, transport.local_addr(), factory);
        let (command_tx, commands) = mpsc::channel(100);
        let (events, _) = broadcast::channel(1000);
        let (lookup_tx, lookup_rx) = mpsc::unbounded_channel();

        let handle = UserAgentHandle {
            commands: command_tx,
            events: events.clone(),
        };
        let agent = Self {
            client,
            transport,
            resolver: Arc::new(resolver),
            commands,
            events,
            lookup_tx,
            lookup_rx,
        };
        (agent, handle)
    }

    /// Run until shutdown or until the socket fails
    pub async fn run(mut self) -> Result<(), SipError> {
        info!("User agent started on {}", self.transport.local_addr());

        loop {
            self.flush().await;

            let wake_at = self
                .client
                .poll_timeout()
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

            let input = tokio::select! {
                datagram = self.transport.receiver().recv() => Input::Datagram(datagram),
                command = self.commands.recv() => Input::Command(command),
                result = self.lookup_rx.recv() => Input::Lookup(result),
                _ = tokio::time::sleep_until(wake_at) => Input::Timeout,
            };

            let now = Instant::now();
            match input {
                Input::Datagram(Some(datagram)) => {
                    self.client.handle_datagram(now, datagram.source, &datagram.data);
                }
                Input::Datagram(None) => {
                    error!("Transport closed");
                    return Err(SipError::TransportError("receive loop stopped".to_string()));
                }
                Input::Command(None) | Input::Command(Some(Command::Shutdown)) => break,
                Input::Command(Some(command)) => self.handle_command(now, command),
                Input::Lookup(Some(LookupResult::Srv(kind, records))) => {
                    self.client.handle_srv_lookup(kind, records);
                }
                Input::Lookup(Some(LookupResult::Host(kind, address))) => {
                    self.client.handle_host_lookup(now, kind, address);
                }
                // we hold a sender, so this never closes
                Input::Lookup(None) => {}
                Input::Timeout => self.client.handle_timeout(now),
            }
        }

        info!("User agent stopped");
        Ok(())
    }

    fn handle_command(&mut self, now: Instant, command: Command) {
        debug!("Command {:?}", command);
        match command {
            Command::Connect => self.client.connect_to_server(now),
            Command::Disconnect => self.client.disconnect_from_server(now),
            Command::Call { recipient, reply } => {
                let _ = reply.send(self.client.call(now, &recipient));
            }
            Command::Accept { call_id, reply } => {
                let _ = reply.send(self.client.accept(now, &call_id));
            }
            Command::Hangup { call_id, reply } => {
                let _ = reply.send(self.client.hangup(now, &call_id));
            }
            Command::LocalCandidatesChanged { call_id } => {
                if let Err(e) = self.client.handle_local_candidates(now, &call_id) {
                    warn!("{}", e);
                }
            }
            Command::Shutdown => {}
        }
    }

    /// Send queued datagrams, start queued lookups and publish events
    async fn flush(&mut self) {
        while let Some(transmit) = self.client.poll_transmit() {
            if let Err(e) = self.transport.send(&transmit.payload, transmit.destination).await {
                warn!("{}", e);
            }
        }

        while let Some(request) = self.client.poll_lookup() {
            let resolver = self.resolver.clone();
            let tx = self.lookup_tx.clone();
            tokio::spawn(async move {
                let result = match request {
                    LookupRequest::Srv { kind, name } => {
                        let records = resolver.lookup_srv(&name).await.unwrap_or_else(|e| {
                            debug!("{}", e);
                            Vec::new()
                        });
                        LookupResult::Srv(kind, records)
                    }
                    LookupRequest::Host { kind, host, port } => {
                        let address = match resolver.lookup_host(&host, port).await {
                            Ok(address) => Some(address),
                            Err(e) => {
                                warn!("{}", e);
                                None
                            }
                        };
                        LookupResult::Host(kind, address)
                    }
                };
                let _ = tx.send(result);
            });
        }

        while let Some(event) = self.client.poll_event() {
            debug!("Event {}", event.event_type());
            // no subscribers is fine
            let _ = self.events.send(event);
        }
    }
}
