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
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use super::publish::{complete, PublishFlow};
use super::publish_sender::PublishSenderFlow;
use super::{FlowContext, ProtocolFlow};
use crate::channel::ChannelRef;
use crate::config::ProtocolConfig;
use crate::connection::ConnectionProvider;
use crate::error::MqttError;
use crate::ordering::{DispatchClass, DispatcherProvider};
use crate::packet::{Ack, Packet, PacketType, Publish, Qos};
use crate::packet_id::PacketIdRegistry;
use crate::retained_store::RetainedStore;
use crate::session_store::{ClientSession, PendingMessageStatus, SessionRepository};
use crate::topic::TopicEvaluator;

/// What happens to an accepted inbound PUBLISH
#[async_trait]
pub trait PublishProcessor: Send + Sync {
    /// Checks on top of the packet id rules
    fn validate(&self, _client_id: &str, _publish: &Publish) -> Result<(), MqttError> {
        Ok(())
    }

    /// Runs once per accepted message, after its acknowledgment was sent.
    /// A QoS 2 message re-delivered before PUBREL is not processed again.
    async fn process(&self, client_id: &str, publish: &Publish) -> Result<(), MqttError>;
}

/// Inbound PUBLISH and PUBREL handling
pub struct PublishReceiverFlow {
    base: PublishFlow,
    processor: Arc<dyn PublishProcessor>,
}

impl PublishReceiverFlow {
    pub fn new(context: &FlowContext, processor: Arc<dyn PublishProcessor>) -> Self {
        Self {
            base: PublishFlow::new(context),
            processor,
        }
    }

    fn validate(&self, client_id: &str, publish: &Publish) -> Result<(), MqttError> {
        match (publish.qos, publish.packet_id) {
            (Qos::AtMostOnce, Some(packet_id)) => {
                return Err(MqttError::Protocol(format!(
                    "QoS 0 PUBLISH on '{}' carries packet id {packet_id}",
                    publish.topic
                )));
            }
            (Qos::AtLeastOnce | Qos::ExactlyOnce, None | Some(0)) => {
                return Err(MqttError::Protocol(format!(
                    "{:?} PUBLISH on '{}' without packet id",
                    publish.qos, publish.topic
                )));
            }
            _ => {}
        }
        self.processor.validate(client_id, publish)
    }

    async fn handle_publish(&self, client_id: &str, publish: Publish, channel: &ChannelRef) -> Result<(), MqttError> {
        self.validate(client_id, &publish)?;

        let qos = self.base.config.supported_qos(publish.qos);
        let session = self
            .base
            .sessions
            .get(client_id)
            .await
            .ok_or_else(|| MqttError::SessionNotFound(client_id.to_string()))?;
        let packet_id = publish.packet_id.unwrap_or_default();
        let order_id = publish.order_id;

        let ack = match qos {
            Qos::AtMostOnce => {
                let dispatcher = self.base.dispatchers.get_dispatcher(client_id)?;
                complete(&dispatcher, DispatchClass::FirstAck, order_id);
                return self.processor.process(client_id, &publish).await;
            }
            Qos::AtLeastOnce => Packet::PubAck(Ack::with_order(packet_id, order_id)),
            Qos::ExactlyOnce => Packet::PubRec(Ack::with_order(packet_id, order_id)),
        };

        if qos == Qos::ExactlyOnce && session.has_pending_acknowledgement(packet_id, PacketType::PubRec) {
            debug!("Client '{client_id}' re-delivered packet id {packet_id}, repeating PUBREC");
            self.base
                .dispatch_ack(client_id, &ack, channel, PendingMessageStatus::PendingToAcknowledge)
                .await?;
            return Ok(());
        }

        let inbound = self
            .base
            .dispatch_ack(client_id, &ack, channel, PendingMessageStatus::PendingToSend)
            .await?;
        self.processor.process(client_id, &publish).await?;
        match inbound {
            Some(inbound) => self.base.monitor_ack_response(client_id, ack, channel, inbound).await,
            None => Ok(()),
        }
    }

    async fn handle_publish_release(&self, client_id: &str, release: Ack, channel: &ChannelRef) -> Result<(), MqttError> {
        self.base
            .remove_pending_acknowledgement(client_id, release.packet_id, PacketType::PubRec)
            .await?;
        let complete = Packet::PubComp(Ack::with_order(release.packet_id, release.order_id));
        self.base
            .send_ack(client_id, complete, channel, PendingMessageStatus::PendingToSend)
            .await
    }
}

#[async_trait]
impl ProtocolFlow for PublishReceiverFlow {
    async fn execute(&self, client_id: &str, packet: Packet, channel: ChannelRef) -> Result<(), MqttError> {
        match packet {
            Packet::Publish(publish) => self.handle_publish(client_id, publish, &channel).await,
            Packet::PubRel(release) => self.handle_publish_release(client_id, release, &channel).await,
            other => {
                trace!("{:?} is not handled by the publish receiver", other.packet_type());
                Ok(())
            }
        }
    }
}

/// Message that arrived on the server without any matching subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndeliveredMessage {
    pub sender_id: String,
    pub topic: String,
    pub payload: Bytes,
}

/// Server side processing: retained messages and fan-out to subscribers
pub struct ServerPublishProcessor {
    config: ProtocolConfig,
    sessions: Arc<dyn SessionRepository>,
    dispatchers: Arc<DispatcherProvider>,
    packet_ids: Arc<PacketIdRegistry>,
    sender: Arc<PublishSenderFlow>,
    connections: ConnectionProvider,
    retained: RetainedStore,
    topics: Arc<dyn TopicEvaluator>,
    undelivered: broadcast::Sender<UndeliveredMessage>,
}

impl ServerPublishProcessor {
    pub fn new(
        context: &FlowContext,
        sender: Arc<PublishSenderFlow>,
        connections: ConnectionProvider,
        retained: RetainedStore,
        topics: Arc<dyn TopicEvaluator>,
        undelivered: broadcast::Sender<UndeliveredMessage>,
    ) -> Self {
        Self {
            config: context.config.clone(),
            sessions: context.sessions.clone(),
            dispatchers: context.dispatchers.clone(),
            packet_ids: context.packet_ids.clone(),
            sender,
            connections,
            retained,
            topics,
            undelivered,
        }
    }

    /// Publish the stored will of `client_id`, if any
    pub async fn send_will(&self, client_id: &str) -> Result<(), MqttError> {
        let Some(will) = self.connections.take_will(client_id).await else {
            return Ok(());
        };
        info!("Sending will of client '{client_id}' to '{}'", will.topic);

        let publish = Publish::new(will.topic, will.qos, will.payload).with_retain(will.retain);
        if publish.retain {
            self.retain(&publish).await;
        }
        self.forward(client_id, &publish, publish.retain).await
    }

    async fn retain(&self, publish: &Publish) {
        if publish.payload.is_empty() {
            self.retained.remove(&publish.topic).await;
        } else {
            let qos = self.config.supported_qos(publish.qos);
            self.retained
                .store(&publish.topic, qos, publish.payload.clone())
                .await;
        }
    }

    /// Deliver `publish` to every client with a matching subscription.
    ///
    /// Orders for connected subscribers are created before any delivery task
    /// starts, so messages keep their arrival order per subscriber.
    async fn forward(&self, sender_id: &str, publish: &Publish, retain: bool) -> Result<(), MqttError> {
        let mut granted: HashMap<String, Qos> = HashMap::new();
        for session in self.sessions.get_all(&|_: &ClientSession| true).await {
            for subscription in session.subscriptions() {
                if self.topics.matches(&publish.topic, &subscription.topic_filter) {
                    let qos = granted
                        .entry(subscription.client_id.clone())
                        .or_insert(subscription.maximum_qos);
                    *qos = (*qos).max(subscription.maximum_qos);
                }
            }
        }

        if granted.is_empty() {
            trace!("No subscriber for '{}' published by '{sender_id}'", publish.topic);
            let _ = self.undelivered.send(UndeliveredMessage {
                sender_id: sender_id.to_string(),
                topic: publish.topic.clone(),
                payload: publish.payload.clone(),
            });
            return Ok(());
        }

        for (client_id, subscription_qos) in granted {
            let qos = self
                .config
                .supported_qos(subscription_qos.min(publish.qos));
            let mut delivery =
                Publish::new(publish.topic.clone(), qos, publish.payload.clone()).with_retain(retain);
            if qos != Qos::AtMostOnce {
                match self.packet_ids.provider(&client_id).get_packet_id() {
                    Ok(packet_id) => delivery.packet_id = Some(packet_id),
                    Err(e) => {
                        warn!("Dropping message on '{}' for client '{client_id}': {e}", publish.topic);
                        continue;
                    }
                }
            }

            match self.connections.get_connection(&client_id).await {
                Some(channel) => {
                    let order_id = self
                        .dispatchers
                        .get_dispatcher(&client_id)
                        .and_then(|dispatcher| dispatcher.create_order(DispatchClass::Publish));
                    delivery.order_id = match order_id {
                        Ok(order_id) => order_id,
                        Err(e) => {
                            warn!("Dropping message on '{}' for client '{client_id}': {e}", publish.topic);
                            if let Some(packet_id) = delivery.packet_id {
                                self.packet_ids.provider(&client_id).release(packet_id);
                            }
                            continue;
                        }
                    };
                    let sender = self.sender.clone();
                    tokio::spawn(async move {
                        if let Err(e) = sender
                            .send_publish(&client_id, delivery, Some(channel), PendingMessageStatus::PendingToSend)
                            .await
                        {
                            debug!("Delivery to client '{client_id}' ended: {e}");
                        }
                    });
                }
                None => {
                    if let Err(e) = self
                        .sender
                        .send_publish(&client_id, delivery, None, PendingMessageStatus::PendingToSend)
                        .await
                    {
                        error!("Failed to keep message for offline client '{client_id}': {e}");
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PublishProcessor for ServerPublishProcessor {
    fn validate(&self, client_id: &str, publish: &Publish) -> Result<(), MqttError> {
        if !self.topics.is_valid_topic_name(&publish.topic) {
            return Err(MqttError::Protocol(format!(
                "invalid topic name '{}' from client '{client_id}'",
                publish.topic
            )));
        }
        if publish.topic.starts_with('$') {
            return Err(MqttError::Protocol(format!(
                "client '{client_id}' may not publish to '{}'",
                publish.topic
            )));
        }
        Ok(())
    }

    async fn process(&self, client_id: &str, publish: &Publish) -> Result<(), MqttError> {
        if publish.retain {
            self.retain(publish).await;
        }
        self.forward(client_id, publish, false).await
    }
}

/// Application message handed to the user of a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub retain: bool,
}

/// Client side processing: hand every message to the subscribers of
/// [`crate::client::Client::messages`]
pub struct ClientPublishProcessor {
    messages: broadcast::Sender<ApplicationMessage>,
}

impl ClientPublishProcessor {
    pub fn new(messages: broadcast::Sender<ApplicationMessage>) -> Self {
        Self { messages }
    }
}

#[async_trait]
impl PublishProcessor for ClientPublishProcessor {
    async fn process(&self, client_id: &str, publish: &Publish) -> Result<(), MqttError> {
        trace!(
            "Client '{client_id}' received {} byte(s) on '{}'",
            publish.payload.len(),
            publish.topic
        );
        let _ = self.messages.send(ApplicationMessage {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            retain: publish.retain,
        });
        Ok(())
    }
}
