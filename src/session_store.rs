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
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::error::MqttError;
use crate::packet::{Ack, OrderId, Packet, PacketType, Publish, Qos};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingMessageStatus {
    /// Stored while the client was offline, never sent
    PendingToSend,
    /// Sent at least once, waiting for PUBACK or PUBREC
    PendingToAcknowledge,
}

/// Outbound QoS1/QoS2 message not fully acknowledged yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub topic: String,
    pub qos: Qos,
    pub retain: bool,
    pub dup: bool,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    pub status: PendingMessageStatus,
}

impl PendingMessage {
    pub fn from_publish(publish: &Publish, status: PendingMessageStatus) -> Self {
        Self {
            topic: publish.topic.clone(),
            qos: publish.qos,
            retain: publish.retain,
            dup: publish.dup,
            packet_id: publish.packet_id,
            payload: publish.payload.clone(),
            status,
        }
    }

    pub fn to_publish(&self) -> Publish {
        Publish {
            topic: self.topic.clone(),
            qos: self.qos,
            retain: self.retain,
            dup: self.dup,
            packet_id: self.packet_id,
            payload: self.payload.clone(),
            order_id: OrderId::nil(),
        }
    }
}

/// QoS2 handshake step that was sent and still waits for its counterpart:
/// a PUBREC waits for PUBREL, a PUBREL waits for PUBCOMP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAcknowledgement {
    pub packet_id: u16,
    pub packet_type: PacketType,
}

impl PendingAcknowledgement {
    pub fn new(packet_id: u16, packet_type: PacketType) -> Self {
        Self {
            packet_id,
            packet_type,
        }
    }

    /// Packet to resend for this acknowledgement
    pub fn to_packet(&self, order_id: OrderId) -> Option<Packet> {
        let ack = Ack::with_order(self.packet_id, order_id);
        match self.packet_type {
            PacketType::PubRec => Some(Packet::PubRec(ack)),
            PacketType::PubRel => Some(Packet::PubRel(ack)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSubscription {
    pub client_id: String,
    pub topic_filter: String,
    pub maximum_qos: Qos,
}

/// Per-client session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSession {
    pub client_id: String,
    pub clean: bool,
    pending_messages: Vec<PendingMessage>,
    pending_acknowledgements: Vec<PendingAcknowledgement>,
    subscriptions: Vec<ClientSubscription>,
}

impl ClientSession {
    pub fn new(client_id: impl Into<String>, clean: bool) -> Self {
        Self {
            client_id: client_id.into(),
            clean,
            pending_messages: Vec::new(),
            pending_acknowledgements: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    pub fn pending_messages(&self) -> &[PendingMessage] {
        &self.pending_messages
    }

    /// Store a pending message, replacing one with the same packet id
    pub fn save_pending_message(&mut self, message: PendingMessage) {
        match message.packet_id.and_then(|id| {
            self.pending_messages
                .iter()
                .position(|pending| pending.packet_id == Some(id))
        }) {
            Some(index) => self.pending_messages[index] = message,
            None => self.pending_messages.push(message),
        }
        trace!(
            "Client '{}' has {} pending message(s)",
            self.client_id,
            self.pending_messages.len()
        );
    }

    pub fn set_pending_message_status(&mut self, packet_id: u16, status: PendingMessageStatus) {
        if let Some(pending) = self
            .pending_messages
            .iter_mut()
            .find(|pending| pending.packet_id == Some(packet_id))
        {
            pending.status = status;
        }
    }

    pub fn remove_pending_message(&mut self, packet_id: u16) -> bool {
        let before = self.pending_messages.len();
        self.pending_messages
            .retain(|pending| pending.packet_id != Some(packet_id));
        before != self.pending_messages.len()
    }

    pub fn pending_acknowledgements(&self) -> &[PendingAcknowledgement] {
        &self.pending_acknowledgements
    }

    pub fn has_pending_acknowledgement(&self, packet_id: u16, packet_type: PacketType) -> bool {
        self.pending_acknowledgements
            .contains(&PendingAcknowledgement::new(packet_id, packet_type))
    }

    pub fn add_pending_acknowledgement(&mut self, ack: PendingAcknowledgement) {
        if !self.pending_acknowledgements.contains(&ack) {
            self.pending_acknowledgements.push(ack);
        }
    }

    pub fn remove_pending_acknowledgement(&mut self, packet_id: u16, packet_type: PacketType) -> bool {
        let before = self.pending_acknowledgements.len();
        self.pending_acknowledgements
            .retain(|ack| !(ack.packet_id == packet_id && ack.packet_type == packet_type));
        before != self.pending_acknowledgements.len()
    }

    pub fn subscriptions(&self) -> &[ClientSubscription] {
        &self.subscriptions
    }

    /// Insert or update the subscription for its topic filter. Returns true
    /// when the filter was not subscribed before.
    pub fn upsert_subscription(&mut self, subscription: ClientSubscription) -> bool {
        match self
            .subscriptions
            .iter_mut()
            .find(|existing| existing.topic_filter == subscription.topic_filter)
        {
            Some(existing) => {
                existing.maximum_qos = subscription.maximum_qos;
                false
            }
            None => {
                self.subscriptions.push(subscription);
                true
            }
        }
    }

    pub fn remove_subscription(&mut self, topic_filter: &str) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions
            .retain(|subscription| subscription.topic_filter != topic_filter);
        before != self.subscriptions.len()
    }
}

pub type SessionFilter<'a> = &'a (dyn Fn(&ClientSession) -> bool + Send + Sync);

/// Storage of client sessions keyed by client id.
///
/// `modify` is the read-modify-write primitive flows use; implementations
/// must run it atomically with respect to other calls for the same client.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn get(&self, client_id: &str) -> Option<ClientSession>;

    async fn get_all(&self, filter: SessionFilter<'_>) -> Vec<ClientSession>;

    /// Store a new session, replacing any previous session of the client
    async fn create(&self, session: ClientSession) -> Result<(), MqttError>;

    async fn update(&self, session: ClientSession) -> Result<(), MqttError>;

    async fn delete(&self, client_id: &str) -> Option<ClientSession>;

    async fn modify(
        &self,
        client_id: &str,
        change: &mut (dyn for<'s> FnMut(&'s mut ClientSession) + Send),
    ) -> Result<(), MqttError>;
}

/// Run `change` against the stored session of `client_id` and return its result
pub async fn modify_session<R, F>(
    sessions: &dyn SessionRepository,
    client_id: &str,
    change: F,
) -> Result<R, MqttError>
where
    R: Send,
    F: FnOnce(&mut ClientSession) -> R + Send,
{
    let mut change = Some(change);
    let mut result = None;
    sessions
        .modify(client_id, &mut |session| {
            if let Some(change) = change.take() {
                result = Some(change(session));
            }
        })
        .await?;
    result.ok_or_else(|| MqttError::SessionNotFound(client_id.to_string()))
}

/// In-memory session repository
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, ClientSession>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionRepository for SessionStore {
    async fn get(&self, client_id: &str) -> Option<ClientSession> {
        let sessions = self.sessions.read().await;
        sessions.get(client_id).cloned()
    }

    async fn get_all(&self, filter: SessionFilter<'_>) -> Vec<ClientSession> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|session| filter(session))
            .cloned()
            .collect()
    }

    async fn create(&self, session: ClientSession) -> Result<(), MqttError> {
        let mut sessions = self.sessions.write().await;
        debug!("Creating session for client '{}'", session.client_id);
        sessions.insert(session.client_id.clone(), session);
        Ok(())
    }

    async fn update(&self, session: ClientSession) -> Result<(), MqttError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&session.client_id) {
            Some(existing) => {
                *existing = session;
                Ok(())
            }
            None => Err(MqttError::SessionNotFound(session.client_id)),
        }
    }

    async fn delete(&self, client_id: &str) -> Option<ClientSession> {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.remove(client_id);
        if removed.is_some() {
            debug!("Deleted session of client '{client_id}'");
        }
        removed
    }

    async fn modify(
        &self,
        client_id: &str,
        change: &mut (dyn for<'s> FnMut(&'s mut ClientSession) + Send),
    ) -> Result<(), MqttError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(client_id)
            .ok_or_else(|| MqttError::SessionNotFound(client_id.to_string()))?;
        change(session);
        Ok(())
    }
}
