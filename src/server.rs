// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

use crate::channel::ChannelRef;
use crate::config::ProtocolConfig;
use crate::connection::ConnectionProvider;
use crate::error::MqttError;
use crate::flows::{FlowContext, ServerFlows, UndeliveredMessage};
use crate::listener::ServerPacketListener;
use crate::ordering::DispatcherProvider;
use crate::packet_id::PacketIdRegistry;
use crate::retained_store::RetainedStore;
use crate::session_store::{SessionRepository, SessionStore};
use crate::topic::{MqttTopicEvaluator, TopicEvaluator};
use crate::transport::TcpChannel;

const UNDELIVERED_CAPACITY: usize = 1024;

/// MQTT server coordinating all client connections
#[derive(Clone)]
pub struct Server {
    config: ProtocolConfig,

    /// Client sessions, also the source of subscriptions for fan-out
    sessions: Arc<dyn SessionRepository>,

    /// Live channels and wills
    connections: ConnectionProvider,

    /// One packet dispatcher per connected client
    dispatchers: Arc<DispatcherProvider>,

    retained: RetainedStore,

    listener: Arc<ServerPacketListener>,

    /// Messages published without any subscriber
    undelivered: broadcast::Sender<UndeliveredMessage>,

    shutdown: CancellationToken,
}

impl Server {
    /// Create a server with in-memory stores
    pub fn new(config: ProtocolConfig) -> Self {
        Self::with_sessions(config, Arc::new(SessionStore::new()))
    }

    /// Create a server persisting sessions in `sessions`
    pub fn with_sessions(config: ProtocolConfig, sessions: Arc<dyn SessionRepository>) -> Self {
        let connections = ConnectionProvider::new();
        let dispatchers = Arc::new(DispatcherProvider::new());
        let retained = RetainedStore::new();
        let packet_ids = Arc::new(PacketIdRegistry::new());
        let topics: Arc<dyn TopicEvaluator> = Arc::new(MqttTopicEvaluator::new(config.allow_wildcards));
        let (undelivered, _) = broadcast::channel(UNDELIVERED_CAPACITY);

        let context = FlowContext {
            config: config.clone(),
            sessions: sessions.clone(),
            dispatchers: dispatchers.clone(),
            packet_ids: packet_ids.clone(),
        };
        let flows = Arc::new(ServerFlows::new(
            context,
            connections.clone(),
            retained.clone(),
            topics,
            undelivered.clone(),
        ));
        let listener = Arc::new(ServerPacketListener::new(
            config.clone(),
            flows,
            connections.clone(),
            dispatchers.clone(),
            sessions.clone(),
            packet_ids,
        ));

        Self {
            config,
            sessions,
            connections,
            dispatchers,
            retained,
            listener,
            undelivered,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Serve a connection established on any channel
    pub fn accept(&self, channel: ChannelRef) -> JoinHandle<()> {
        let listener = self.listener.clone();
        tokio::spawn(async move {
            listener.listen(channel).await;
        })
    }

    /// Accept TCP connections until [`Server::stop`] is called
    pub async fn serve(&self, tcp_listener: TcpListener) -> Result<(), MqttError> {
        info!("Serving MQTT on {:?}", tcp_listener.local_addr().ok());
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    trace!("Accept loop stopped");
                    return Ok(());
                }
                accepted = tcp_listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        trace!("Accepted TCP connection from {addr}");
                        if let Err(e) = stream.set_nodelay(true) {
                            error!("Failed to set TCP_NODELAY for {addr}: {e}");
                        }
                        self.accept(TcpChannel::new(stream, self.config.max_packet_size));
                    }
                    Err(e) => {
                        error!("Failed to accept TCP connection: {e}");
                    }
                }
            }
        }
    }

    /// Client ids with an open connection
    pub async fn active_clients(&self) -> Vec<String> {
        self.connections.active_clients().await
    }

    /// Stream of messages nobody was subscribed to
    pub fn undelivered_messages(&self) -> broadcast::Receiver<UndeliveredMessage> {
        self.undelivered.subscribe()
    }

    pub fn sessions(&self) -> &Arc<dyn SessionRepository> {
        &self.sessions
    }

    pub fn retained_messages(&self) -> &RetainedStore {
        &self.retained
    }

    /// Stop accepting, close every connection and dispose the dispatchers
    pub async fn stop(&self) {
        info!("Stopping server");
        self.shutdown.cancel();
        self.connections.close_all().await;
        self.dispatchers.dispose();
    }
}
