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

//! Packet listeners.
//!
//! A listener owns the inbound side of one connection: it enforces the
//! connection handshake, registers dispatch orders for ordered inbound
//! packets, runs the matching flow for every packet on its own task and
//! supervises keep alive.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::channel::ChannelRef;
use crate::config::ProtocolConfig;
use crate::connection::ConnectionProvider;
use crate::error::MqttError;
use crate::flows::{discard_session, ClientFlows, FlowProvider, ProtocolFlow, ServerFlows};
use crate::ordering::{DispatchClass, DispatcherProvider};
use crate::packet::{OrderId, Packet, PacketType};
use crate::packet_id::PacketIdRegistry;
use crate::session_store::SessionRepository;

/// Next inbound packet, `None` once the channel closed
async fn next_packet(inbound: &mut broadcast::Receiver<Packet>) -> Option<Packet> {
    loop {
        match inbound.recv().await {
            Ok(packet) => return Some(packet),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Listener skipped {skipped} inbound packet(s)");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

/// Class of the order an inbound packet's response travels in. PUBACK and
/// PUBCOMP finish their handshake and need none.
fn response_class(packet_type: PacketType) -> Option<DispatchClass> {
    match packet_type {
        PacketType::Publish => Some(DispatchClass::FirstAck),
        PacketType::PubRec => Some(DispatchClass::SecondAck),
        PacketType::PubRel => Some(DispatchClass::ThirdAck),
        _ => None,
    }
}

/// Create the response order for an ordered inbound packet and bind the
/// packet to it
fn register_for_dispatch(
    dispatchers: &DispatcherProvider,
    client_id: &str,
    packet: &mut Packet,
) -> Result<Option<(DispatchClass, OrderId)>, MqttError> {
    let Some(class) = response_class(packet.packet_type()) else {
        return Ok(None);
    };
    let order_id = dispatchers.get_dispatcher(client_id)?.create_order(class)?;
    packet.reassign_order(order_id)?;
    Ok(Some((class, order_id)))
}

/// Run the flow for `packet` on its own task. Protocol violations are
/// reported on `violations`; the response order is released when the flow
/// fails before doing so.
fn spawn_flow(
    flows: &dyn FlowProvider,
    dispatchers: &Arc<DispatcherProvider>,
    client_id: &str,
    mut packet: Packet,
    channel: &ChannelRef,
    violations: &mpsc::Sender<MqttError>,
) {
    let packet_type = packet.packet_type();
    let Some(flow) = flows.get_flow(packet_type) else {
        debug!("Ignoring {packet_type:?} from '{client_id}'");
        return;
    };
    let response_order = match register_for_dispatch(dispatchers, client_id, &mut packet) {
        Ok(order) => order,
        Err(e) => {
            debug!("Cannot register {packet_type:?} from '{client_id}' for dispatch: {e}");
            return;
        }
    };

    match &packet {
        Packet::Publish(publish) => trace!(
            "Dispatching PUBLISH on '{}' from '{client_id}'",
            publish.topic
        ),
        _ => trace!("Dispatching {packet_type:?} from '{client_id}'"),
    }

    let dispatchers = dispatchers.clone();
    let client_id = client_id.to_string();
    let channel = channel.clone();
    let violations = violations.clone();
    tokio::spawn(async move {
        let Err(e) = flow.execute(&client_id, packet, channel).await else {
            return;
        };
        if let Some((class, order_id)) = response_order {
            if let Ok(dispatcher) = dispatchers.get_dispatcher(&client_id) {
                let _ = dispatcher.complete_order(class, order_id);
            }
        }
        match e {
            MqttError::Protocol(_) => {
                let _ = violations.send(e).await;
            }
            MqttError::SessionNotFound(_) => {
                error!("{packet_type:?} flow of client '{client_id}' failed: {e}")
            }
            MqttError::ChannelClosed => {
                debug!("{packet_type:?} flow of client '{client_id}' stopped: {e}")
            }
            other => warn!("{packet_type:?} flow of client '{client_id}' failed: {other}"),
        }
    });
}

/// Server side listener
pub struct ServerPacketListener {
    config: ProtocolConfig,
    flows: Arc<ServerFlows>,
    connections: ConnectionProvider,
    dispatchers: Arc<DispatcherProvider>,
    sessions: Arc<dyn SessionRepository>,
    packet_ids: Arc<PacketIdRegistry>,
}

impl ServerPacketListener {
    pub fn new(
        config: ProtocolConfig,
        flows: Arc<ServerFlows>,
        connections: ConnectionProvider,
        dispatchers: Arc<DispatcherProvider>,
        sessions: Arc<dyn SessionRepository>,
        packet_ids: Arc<PacketIdRegistry>,
    ) -> Self {
        Self {
            config,
            flows,
            connections,
            dispatchers,
            sessions,
            packet_ids,
        }
    }

    /// Serve one connection until it closes
    pub async fn listen(&self, channel: ChannelRef) {
        let mut inbound = channel.receiver_stream();

        let first = match tokio::time::timeout(self.config.wait_timeout, next_packet(&mut inbound)).await {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                trace!("Connection closed before CONNECT");
                return;
            }
            Err(_) => {
                warn!("No CONNECT received within {:?}", self.config.wait_timeout);
                channel.close().await;
                return;
            }
        };
        let Packet::Connect(connect) = first else {
            warn!("First packet must be CONNECT, got {:?}", first.packet_type());
            channel.close().await;
            return;
        };

        let keep_alive = connect.keep_alive;
        let client_id = match self.flows.connect.connect(connect, &channel).await {
            Ok(Some(client_id)) => client_id,
            Ok(None) => {
                channel.close().await;
                return;
            }
            Err(e) => {
                error!("Failed to accept CONNECT: {e}");
                channel.close().await;
                return;
            }
        };

        let graceful = self.receive(&client_id, keep_alive, &channel, &mut inbound).await;
        channel.close().await;
        self.end_connection(&client_id, &channel, graceful).await;
    }

    /// Packet loop after CONNECT. Returns whether the client disconnected
    /// gracefully.
    async fn receive(
        &self,
        client_id: &str,
        keep_alive: u16,
        channel: &ChannelRef,
        inbound: &mut broadcast::Receiver<Packet>,
    ) -> bool {
        let tolerance = (keep_alive > 0).then(|| ProtocolConfig::keep_alive_tolerance(keep_alive));
        let (violations_tx, mut violations) = mpsc::channel(16);

        loop {
            let next = async {
                match tolerance {
                    Some(tolerance) => tokio::time::timeout(tolerance, next_packet(inbound)).await.ok(),
                    None => Some(next_packet(inbound).await),
                }
            };

            tokio::select! {
                Some(violation) = violations.recv() => {
                    warn!("Closing connection of client '{client_id}': {violation}");
                    return false;
                }
                received = next => match received {
                    None => {
                        warn!("Client '{client_id}' exceeded keep alive tolerance of {tolerance:?}");
                        return false;
                    }
                    Some(None) => {
                        debug!("Connection of client '{client_id}' closed");
                        return false;
                    }
                    Some(Some(Packet::Connect(_))) => {
                        warn!("Client '{client_id}' sent a second CONNECT");
                        return false;
                    }
                    Some(Some(Packet::Disconnect)) => {
                        if let Err(e) = self.flows.disconnect.execute(client_id, Packet::Disconnect, channel.clone()).await {
                            debug!("DISCONNECT of client '{client_id}' failed: {e}");
                        }
                        return true;
                    }
                    Some(Some(packet)) => spawn_flow(
                        self.flows.as_ref(),
                        &self.dispatchers,
                        client_id,
                        packet,
                        channel,
                        &violations_tx,
                    ),
                }
            }
        }
    }

    async fn end_connection(&self, client_id: &str, channel: &ChannelRef, graceful: bool) {
        if !self.connections.remove_connection(client_id, channel).await {
            debug!("Client '{client_id}' already continues on another connection");
            return;
        }
        if !graceful {
            if let Err(e) = self.flows.processor.send_will(client_id).await {
                error!("Failed to send will of client '{client_id}': {e}");
            }
        }
        self.dispatchers.remove_dispatcher(client_id);

        if self
            .sessions
            .get(client_id)
            .await
            .is_some_and(|session| session.clean)
        {
            discard_session(self.sessions.as_ref(), &self.packet_ids, client_id).await;
        }
        info!("Client '{client_id}' disconnected");
    }
}

/// Client side listener
pub struct ClientPacketListener {
    config: ProtocolConfig,
    flows: Arc<ClientFlows>,
    dispatchers: Arc<DispatcherProvider>,
}

impl ClientPacketListener {
    pub fn new(config: ProtocolConfig, flows: Arc<ClientFlows>, dispatchers: Arc<DispatcherProvider>) -> Self {
        Self {
            config,
            flows,
            dispatchers,
        }
    }

    /// Serve the connection of `client_id` until it closes. `inbound` must be
    /// subscribed before CONNECT is sent.
    pub async fn listen(&self, client_id: String, channel: ChannelRef, mut inbound: broadcast::Receiver<Packet>) {
        let (violations_tx, mut violations) = mpsc::channel(16);

        match next_packet(&mut inbound).await {
            Some(Packet::ConnAck(ack)) => {
                trace!("Client '{client_id}' received CONNACK {:?}", ack.return_code);
                spawn_flow(
                    self.flows.as_ref(),
                    &self.dispatchers,
                    &client_id,
                    Packet::ConnAck(ack),
                    &channel,
                    &violations_tx,
                );
            }
            Some(other) => {
                warn!("First packet must be CONNACK, got {:?}", other.packet_type());
                channel.close().await;
                return;
            }
            None => return,
        }

        let mut outbound = channel.sender_stream();
        let mut keep_alive = (self.config.keep_alive_secs > 0)
            .then(|| Duration::from_secs(u64::from(self.config.keep_alive_secs)));
        let idle = tokio::time::sleep(keep_alive.unwrap_or(Duration::from_secs(3600)));
        tokio::pin!(idle);

        loop {
            tokio::select! {
                Some(violation) = violations.recv() => {
                    warn!("Closing connection of client '{client_id}': {violation}");
                    break;
                }
                received = next_packet(&mut inbound) => match received {
                    Some(packet) => spawn_flow(
                        self.flows.as_ref(),
                        &self.dispatchers,
                        &client_id,
                        packet,
                        &channel,
                        &violations_tx,
                    ),
                    None => {
                        debug!("Connection of client '{client_id}' closed");
                        break;
                    }
                },
                sent = outbound.recv() => match sent {
                    Ok(Packet::Disconnect) => keep_alive = None,
                    Ok(_) => {
                        if let Some(keep_alive) = keep_alive {
                            idle.as_mut().reset(Instant::now() + keep_alive);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                () = &mut idle, if keep_alive.is_some() => {
                    trace!("Client '{client_id}' idle for {keep_alive:?}, sending PINGREQ");
                    if let Err(e) = channel.send(Packet::PingReq).await {
                        debug!("Failed to send PINGREQ for client '{client_id}': {e}");
                        break;
                    }
                    if let Some(keep_alive) = keep_alive {
                        idle.as_mut().reset(Instant::now() + keep_alive);
                    }
                }
            }
        }

        channel.close().await;
        self.dispatchers.remove_dispatcher(&client_id);
    }
}
