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

use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::net::ToSocketAddrs;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::channel::ChannelRef;
use crate::config::ProtocolConfig;
use crate::error::{ClientError, MqttError};
use crate::flows::{ApplicationMessage, ClientFlows, FlowContext};
use crate::listener::ClientPacketListener;
use crate::lock;
use crate::ordering::DispatcherProvider;
use crate::packet::{
    Connect, ConnectReturnCode, Packet, Publish, Qos, Subscribe, SubscribeReturnCode, Subscription,
    Unsubscribe, Will,
};
use crate::packet_id::PacketIdRegistry;
use crate::session_store::{ClientSession, PendingMessageStatus, SessionRepository, SessionStore};
use crate::transport::TcpChannel;

const MESSAGES_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub user_name: Option<String>,
    pub password: Option<Bytes>,
}

impl ClientCredentials {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Default)]
struct ClientState {
    client_id: Option<String>,
    listener: Option<JoinHandle<()>>,
}

/// MQTT client over one channel
pub struct Client {
    config: ProtocolConfig,
    channel: ChannelRef,
    sessions: Arc<dyn SessionRepository>,
    dispatchers: Arc<DispatcherProvider>,
    packet_ids: Arc<PacketIdRegistry>,
    flows: Arc<ClientFlows>,
    messages: broadcast::Sender<ApplicationMessage>,
    state: Mutex<ClientState>,
}

impl Client {
    pub fn new(channel: ChannelRef, config: ProtocolConfig) -> Self {
        Self::with_sessions(channel, config, Arc::new(SessionStore::new()))
    }

    /// Client keeping its session in `sessions`, which lets a later client
    /// resume it
    pub fn with_sessions(channel: ChannelRef, config: ProtocolConfig, sessions: Arc<dyn SessionRepository>) -> Self {
        let dispatchers = Arc::new(DispatcherProvider::new());
        let packet_ids = Arc::new(PacketIdRegistry::new());
        let (messages, _) = broadcast::channel(MESSAGES_CAPACITY);
        let context = FlowContext {
            config: config.clone(),
            sessions: sessions.clone(),
            dispatchers: dispatchers.clone(),
            packet_ids: packet_ids.clone(),
        };
        Self {
            flows: Arc::new(ClientFlows::new(context, messages.clone())),
            config,
            channel,
            sessions,
            dispatchers,
            packet_ids,
            messages,
            state: Mutex::new(ClientState::default()),
        }
    }

    /// Open a TCP connection to `addr`
    pub async fn connect_tcp<A: ToSocketAddrs>(addr: A, config: ProtocolConfig) -> Result<Self, ClientError> {
        let channel = TcpChannel::connect(addr, config.wait_timeout, config.max_packet_size).await?;
        Ok(Self::new(channel, config))
    }

    pub fn client_id(&self) -> Option<String> {
        lock(&self.state).client_id.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected() && lock(&self.state).client_id.is_some()
    }

    /// Messages received on subscribed topics
    pub fn messages(&self) -> broadcast::Receiver<ApplicationMessage> {
        self.messages.subscribe()
    }

    /// Send CONNECT and wait for CONNACK. Returns whether the server still
    /// had a session for this client.
    pub async fn connect(
        &self,
        credentials: ClientCredentials,
        will: Option<Will>,
        clean_session: bool,
    ) -> Result<bool, ClientError> {
        if !self.channel.is_connected() {
            return Err(ClientError::Disconnected);
        }
        let client_id = credentials.client_id;
        self.open_session(&client_id, clean_session).await?;

        let mut inbound = self.channel.receiver_stream();
        let listener = ClientPacketListener::new(self.config.clone(), self.flows.clone(), self.dispatchers.clone());
        let listener_task = {
            let client_id = client_id.clone();
            let channel = self.channel.clone();
            let inbound = self.channel.receiver_stream();
            tokio::spawn(async move { listener.listen(client_id, channel, inbound).await })
        };
        if let Some(previous) = lock(&self.state).listener.replace(listener_task) {
            previous.abort();
        }

        let connect = Connect {
            client_id: client_id.clone(),
            clean_session,
            keep_alive: self.config.keep_alive_secs,
            user_name: credentials.user_name,
            password: credentials.password,
            will,
        };
        self.channel.send(Packet::Connect(connect)).await?;

        let ack = self
            .wait_for("CONNACK", &mut inbound, |packet| match packet {
                Packet::ConnAck(ack) => Some(*ack),
                _ => None,
            })
            .await?;
        if ack.return_code != ConnectReturnCode::Accepted {
            return Err(ClientError::ConnectionRefused(ack.return_code));
        }

        lock(&self.state).client_id = Some(client_id.clone());
        info!("Client '{client_id}' connected (session present: {})", ack.session_present);
        Ok(ack.session_present)
    }

    /// Subscribe to `topic_filter` and return what the server granted
    pub async fn subscribe(&self, topic_filter: &str, qos: Qos) -> Result<SubscribeReturnCode, ClientError> {
        let packet_ids = self.packet_ids.provider(&self.ensure_connected()?);
        let packet_id = packet_ids.get_packet_id()?;
        let subscribe = Subscribe {
            packet_id,
            subscriptions: vec![Subscription {
                topic_filter: topic_filter.to_string(),
                qos,
            }],
        };

        let result = self
            .request(Packet::Subscribe(subscribe), "SUBACK", |packet| match packet {
                Packet::SubAck(suback) if suback.packet_id == packet_id => {
                    Some(suback.return_codes.first().copied().unwrap_or(SubscribeReturnCode::Failure))
                }
                _ => None,
            })
            .await;
        packet_ids.release(packet_id);
        result
    }

    pub async fn unsubscribe(&self, topic_filters: &[&str]) -> Result<(), ClientError> {
        let packet_ids = self.packet_ids.provider(&self.ensure_connected()?);
        let packet_id = packet_ids.get_packet_id()?;
        let unsubscribe = Unsubscribe {
            packet_id,
            topic_filters: topic_filters.iter().map(|filter| filter.to_string()).collect(),
        };

        let result = self
            .request(Packet::Unsubscribe(unsubscribe), "UNSUBACK", |packet| match packet {
                Packet::UnsubAck(id) if *id == packet_id => Some(()),
                _ => None,
            })
            .await;
        packet_ids.release(packet_id);
        result
    }

    /// Publish a message. Resolves once its QoS handshake finished.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: Qos,
        retain: bool,
    ) -> Result<(), ClientError> {
        let client_id = self.ensure_connected()?;
        let mut publish = Publish::new(topic, qos, payload).with_retain(retain);
        if qos != Qos::AtMostOnce {
            publish.packet_id = Some(self.packet_ids.provider(&client_id).get_packet_id()?);
        }
        self.flows
            .publish_sender
            .send_publish(
                &client_id,
                publish,
                Some(self.channel.clone()),
                PendingMessageStatus::PendingToSend,
            )
            .await?;
        debug!("Client '{client_id}' published to '{topic}'");
        Ok(())
    }

    /// Send DISCONNECT and close the channel. A clean session is discarded.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let client_id = self.ensure_connected()?;
        if self
            .sessions
            .get(&client_id)
            .await
            .is_some_and(|session| session.clean)
        {
            self.sessions.delete(&client_id).await;
            self.packet_ids.remove(&client_id);
        }

        let sent = self.channel.send(Packet::Disconnect).await;
        self.channel.close().await;
        self.dispatchers.remove_dispatcher(&client_id);
        lock(&self.state).client_id = None;
        info!("Client '{client_id}' disconnected");
        sent.map_err(ClientError::from)
    }

    fn ensure_connected(&self) -> Result<String, ClientError> {
        match lock(&self.state).client_id.clone() {
            Some(client_id) if self.channel.is_connected() => Ok(client_id),
            _ => Err(ClientError::NotConnected),
        }
    }

    async fn open_session(&self, client_id: &str, clean_session: bool) -> Result<(), MqttError> {
        if clean_session {
            self.sessions.delete(client_id).await;
            self.packet_ids.remove(client_id);
        }
        if self.sessions.get(client_id).await.is_none() {
            self.sessions
                .create(ClientSession::new(client_id, clean_session))
                .await?;
        }
        Ok(())
    }

    /// Send `packet` and wait for the response selected by `select`
    async fn request<T>(
        &self,
        packet: Packet,
        waiting_for: &'static str,
        select: impl Fn(&Packet) -> Option<T>,
    ) -> Result<T, ClientError> {
        let mut inbound = self.channel.receiver_stream();
        self.channel.send(packet).await?;
        self.wait_for(waiting_for, &mut inbound, select).await
    }

    async fn wait_for<T>(
        &self,
        waiting_for: &'static str,
        inbound: &mut broadcast::Receiver<Packet>,
        select: impl Fn(&Packet) -> Option<T>,
    ) -> Result<T, ClientError> {
        let timeout = self.config.wait_timeout;
        let wait = async {
            loop {
                match inbound.recv().await {
                    Ok(packet) => {
                        if let Some(found) = select(&packet) {
                            return Ok(found);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return Err(ClientError::Disconnected),
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ClientError::Timeout { waiting_for, timeout })?
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(listener) = lock(&self.state).listener.take() {
            listener.abort();
        }
    }
}

