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

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::publish_sender::PublishSenderFlow;
use super::{FlowContext, ProtocolFlow};
use crate::channel::ChannelRef;
use crate::connection::ConnectionProvider;
use crate::error::MqttError;
use crate::ordering::{DispatchClass, DispatcherProvider};
use crate::packet::{ConnAck, Connect, ConnectReturnCode, Packet};
use crate::packet_id::PacketIdRegistry;
use crate::session_store::{ClientSession, PendingMessageStatus, SessionRepository};

/// Re-send what a resumed session still owes its peer: pending messages
/// first, then pending acknowledgments.
///
/// Orders are created here one after the other so replayed packets go out in
/// their stored order; the handshakes themselves run on their own tasks.
async fn replay_session(
    sender: &Arc<PublishSenderFlow>,
    dispatchers: &DispatcherProvider,
    packet_ids: &PacketIdRegistry,
    session: &ClientSession,
    channel: &ChannelRef,
) -> Result<(), MqttError> {
    let client_id = session.client_id.as_str();
    let packet_ids = packet_ids.provider(client_id);
    let dispatcher = dispatchers.get_dispatcher(client_id)?;
    let pending_messages = session.pending_messages();
    let pending_acknowledgements = session.pending_acknowledgements();
    if !pending_messages.is_empty() || !pending_acknowledgements.is_empty() {
        info!(
            "Replaying {} message(s) and {} acknowledgment(s) for client '{client_id}'",
            pending_messages.len(),
            pending_acknowledgements.len()
        );
    }

    for pending in pending_messages {
        let mut publish = pending.to_publish();
        if let Some(packet_id) = publish.packet_id {
            packet_ids.reserve(packet_id);
        }
        publish.dup = pending.status == PendingMessageStatus::PendingToAcknowledge;
        publish.order_id = dispatcher.create_order(DispatchClass::Publish)?;

        let sender = sender.clone();
        let client_id = client_id.to_string();
        let channel = channel.clone();
        tokio::spawn(async move {
            if let Err(e) = sender
                .send_publish(&client_id, publish, Some(channel), PendingMessageStatus::PendingToAcknowledge)
                .await
            {
                debug!("Replayed delivery to client '{client_id}' ended: {e}");
            }
        });
    }

    for pending in pending_acknowledgements {
        let Some(class) = DispatchClass::of(pending.packet_type) else {
            continue;
        };
        let order_id = dispatcher.create_order(class)?;
        let Some(ack) = pending.to_packet(order_id) else {
            dispatcher.complete_order(class, order_id)?;
            continue;
        };

        let sender = sender.clone();
        let client_id = client_id.to_string();
        let channel = channel.clone();
        tokio::spawn(async move {
            if let Err(e) = sender
                .send_ack(&client_id, ack, &channel, PendingMessageStatus::PendingToAcknowledge)
                .await
            {
                debug!("Replayed acknowledgment to client '{client_id}' ended: {e}");
            }
        });
    }
    Ok(())
}

/// Delete the session of `client_id` together with its packet ids
pub(crate) async fn discard_session(
    sessions: &dyn SessionRepository,
    packet_ids: &PacketIdRegistry,
    client_id: &str,
) {
    sessions.delete(client_id).await;
    packet_ids.remove(client_id);
}

/// CONNECT handling on the server
pub struct ServerConnectFlow {
    context: FlowContext,
    sender: Arc<PublishSenderFlow>,
    connections: ConnectionProvider,
}

impl ServerConnectFlow {
    pub fn new(context: &FlowContext, sender: Arc<PublishSenderFlow>, connections: ConnectionProvider) -> Self {
        Self {
            context: context.clone(),
            sender,
            connections,
        }
    }

    /// Accept or reject `connect` arriving on `channel`.
    ///
    /// Returns the client id the connection is registered under, or `None`
    /// when CONNACK refused it.
    pub async fn connect(&self, connect: Connect, channel: &ChannelRef) -> Result<Option<String>, MqttError> {
        let clean_session = connect.clean_session;
        let client_id = if connect.client_id.is_empty() {
            if !clean_session {
                warn!("Rejecting CONNECT with empty client id and persistent session");
                channel
                    .send(Packet::ConnAck(ConnAck {
                        session_present: false,
                        return_code: ConnectReturnCode::IdentifierRejected,
                    }))
                    .await?;
                return Ok(None);
            }
            format!("auto-{}", Uuid::new_v4().simple())
        } else {
            connect.client_id
        };

        let sessions = self.context.sessions.as_ref();
        if clean_session {
            discard_session(sessions, &self.context.packet_ids, &client_id).await;
        }
        let session = match sessions.get(&client_id).await {
            Some(session) => Some(session),
            None => {
                sessions
                    .create(ClientSession::new(client_id.clone(), clean_session))
                    .await?;
                None
            }
        };
        let session_present = session.is_some();

        if let Some(previous) = self.connections.add_connection(&client_id, channel.clone()).await {
            info!("Client '{client_id}' reconnected, closing its previous connection");
            previous.close().await;
            // Orders of the old connection must not hold back the new one
            self.context.dispatchers.remove_dispatcher(&client_id);
        }

        match connect.will {
            Some(will) => self.connections.set_will(&client_id, will).await,
            None => self.connections.remove_will(&client_id).await,
        }

        channel
            .send(Packet::ConnAck(ConnAck {
                session_present,
                return_code: ConnectReturnCode::Accepted,
            }))
            .await?;
        info!("Client '{client_id}' connected (clean session: {clean_session}, session present: {session_present})");

        if let Some(session) = session {
            replay_session(
                &self.sender,
                &self.context.dispatchers,
                &self.context.packet_ids,
                &session,
                channel,
            )
            .await?;
        }
        Ok(Some(client_id))
    }
}

#[async_trait]
impl ProtocolFlow for ServerConnectFlow {
    async fn execute(&self, _client_id: &str, packet: Packet, channel: ChannelRef) -> Result<(), MqttError> {
        match packet {
            Packet::Connect(connect) => self.connect(connect, &channel).await.map(|_| ()),
            other => Err(MqttError::Protocol(format!(
                "{:?} is not a CONNECT",
                other.packet_type()
            ))),
        }
    }
}

/// CONNACK handling on the client: resume the session once accepted
pub struct ClientConnectFlow {
    context: FlowContext,
    sender: Arc<PublishSenderFlow>,
}

impl ClientConnectFlow {
    pub fn new(context: &FlowContext, sender: Arc<PublishSenderFlow>) -> Self {
        Self {
            context: context.clone(),
            sender,
        }
    }
}

#[async_trait]
impl ProtocolFlow for ClientConnectFlow {
    async fn execute(&self, client_id: &str, packet: Packet, channel: ChannelRef) -> Result<(), MqttError> {
        let Packet::ConnAck(ack) = packet else {
            return Ok(());
        };
        if ack.return_code != ConnectReturnCode::Accepted {
            return Ok(());
        }

        let session = self
            .context
            .sessions
            .get(client_id)
            .await
            .ok_or_else(|| MqttError::SessionNotFound(client_id.to_string()))?;
        replay_session(
            &self.sender,
            &self.context.dispatchers,
            &self.context.packet_ids,
            &session,
            &channel,
        )
        .await
    }
}
