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
use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::publish::{complete, wait_for_packet, PublishFlow, Retransmit};
use super::{FlowContext, ProtocolFlow};
use crate::channel::ChannelRef;
use crate::error::MqttError;
use crate::ordering::DispatchClass;
use crate::packet::{Ack, Packet, PacketType, Publish, Qos};
use crate::packet_id::PacketIdRegistry;
use crate::session_store::{modify_session, PendingMessage, PendingMessageStatus};

/// Outbound PUBLISH handshakes.
///
/// As a [`ProtocolFlow`] it handles the acknowledgments a peer sends for our
/// PUBLISH packets: PUBACK, PUBREC and PUBCOMP.
pub struct PublishSenderFlow {
    base: PublishFlow,
    packet_ids: Arc<PacketIdRegistry>,
}

impl PublishSenderFlow {
    pub fn new(context: &FlowContext) -> Self {
        Self {
            base: PublishFlow::new(context),
            packet_ids: context.packet_ids.clone(),
        }
    }

    /// Deliver `publish` to `client_id` and drive its QoS handshake.
    ///
    /// Without a connected channel the message is stored as pending and any
    /// order already attached to it is released. A nil order id gets a fresh
    /// Publish order. Resolves once QoS 0 is written, QoS 1 is acknowledged
    /// or QoS 2 is completed.
    pub async fn send_publish(
        &self,
        client_id: &str,
        publish: Publish,
        channel: Option<ChannelRef>,
        status: PendingMessageStatus,
    ) -> Result<(), MqttError> {
        let caller_order = publish.order_id;
        let result = self.deliver(client_id, publish, channel, status).await;
        if result.is_err() && !caller_order.is_nil() {
            // A failed publish must not hold back later orders of its class
            if let Ok(dispatcher) = self.base.dispatchers.get_dispatcher(client_id) {
                complete(&dispatcher, DispatchClass::Publish, caller_order);
            }
        }
        result
    }

    async fn deliver(
        &self,
        client_id: &str,
        mut publish: Publish,
        channel: Option<ChannelRef>,
        status: PendingMessageStatus,
    ) -> Result<(), MqttError> {
        let Some(channel) = channel.filter(|channel| channel.is_connected()) else {
            debug!(
                "Client '{client_id}' is offline, keeping message for '{}'",
                publish.topic
            );
            self.save_message(client_id, &publish, PendingMessageStatus::PendingToSend)
                .await?;
            if !publish.order_id.is_nil() {
                let dispatcher = self.base.dispatchers.get_dispatcher(client_id)?;
                complete(&dispatcher, DispatchClass::Publish, publish.order_id);
            }
            return Ok(());
        };

        let qos = self.base.config.supported_qos(publish.qos);
        if qos == Qos::AtMostOnce {
            if let Some(packet_id) = publish.packet_id.take() {
                self.packet_ids.provider(client_id).release(packet_id);
            }
        }
        publish.qos = qos;

        if qos != Qos::AtMostOnce {
            match status {
                PendingMessageStatus::PendingToSend => {
                    self.save_message(client_id, &publish, PendingMessageStatus::PendingToAcknowledge)
                        .await?
                }
                PendingMessageStatus::PendingToAcknowledge => {
                    let packet_id = publish.packet_id.unwrap_or_default();
                    modify_session(self.base.sessions.as_ref(), client_id, |session| {
                        session.set_pending_message_status(
                            packet_id,
                            PendingMessageStatus::PendingToAcknowledge,
                        )
                    })
                    .await?
                }
            }
        }

        let dispatcher = self.base.dispatchers.get_dispatcher(client_id)?;
        if publish.order_id.is_nil() {
            publish.order_id = dispatcher.create_order(DispatchClass::Publish)?;
        }
        let order_id = publish.order_id;
        let packet_id = publish.packet_id.unwrap_or_default();

        // Subscribe before writing so no acknowledgment can slip past
        let inbound = channel.receiver_stream();
        let mut completion = channel.receiver_stream();
        trace!(
            "Sending PUBLISH '{}' {qos:?} packet id {packet_id} to client '{client_id}' in order {order_id}",
            publish.topic
        );
        if let Err(e) = self
            .base
            .dispatch(&dispatcher, client_id, Packet::Publish(publish.clone()), &channel)
            .await
        {
            complete(&dispatcher, DispatchClass::Publish, order_id);
            return Err(e);
        }

        let result = match qos {
            Qos::AtMostOnce => Ok(()),
            Qos::AtLeastOnce => {
                let acknowledged = self
                    .base
                    .monitor_ack(
                        client_id,
                        Packet::Publish(publish),
                        &channel,
                        inbound,
                        PacketType::PubAck,
                        Retransmit::SameOrder,
                    )
                    .await;
                match acknowledged {
                    Ok(()) => self.remove_pending_message(client_id, packet_id).await.map(|_| ()),
                    Err(e) => Err(e),
                }
            }
            Qos::ExactlyOnce => {
                let received = self
                    .base
                    .monitor_ack(
                        client_id,
                        Packet::Publish(publish),
                        &channel,
                        inbound,
                        PacketType::PubRec,
                        Retransmit::SameOrder,
                    )
                    .await;
                // PUBREL travels in its own order, created when PUBREC arrives
                complete(&dispatcher, DispatchClass::Publish, order_id);
                match received {
                    Ok(()) => self.wait_for_completion(&mut completion, packet_id).await,
                    Err(e) => Err(e),
                }
            }
        };

        complete(&dispatcher, DispatchClass::Publish, order_id);
        result
    }

    /// Wait for the PUBCOMP closing a QoS 2 handshake.
    ///
    /// The PUBREL is retransmitted by the flow handling the PUBREC. With a
    /// retry ceiling that flow gives up after `max_retries + 1` intervals, so
    /// this wait ends one interval later.
    async fn wait_for_completion(
        &self,
        completion: &mut broadcast::Receiver<Packet>,
        packet_id: u16,
    ) -> Result<(), MqttError> {
        let wait = wait_for_packet(completion, PacketType::PubComp, packet_id);
        let limit = self.base.config.max_retries.and_then(|max| {
            self.base
                .config
                .wait_timeout
                .checked_mul(max.saturating_add(2))
                .map(|limit| (max, limit))
        });
        let Some((retries, limit)) = limit else {
            return wait.await.map(|_| ());
        };
        match tokio::time::timeout(limit, wait).await {
            Ok(received) => received.map(|_| ()),
            Err(_) => Err(MqttError::AckRetriesExhausted {
                expected: PacketType::PubComp,
                packet_id,
                retries,
            }),
        }
    }

    /// Send an acknowledgment, see [`PublishFlow::send_ack`]
    pub async fn send_ack(
        &self,
        client_id: &str,
        ack: Packet,
        channel: &ChannelRef,
        status: PendingMessageStatus,
    ) -> Result<(), MqttError> {
        self.base.send_ack(client_id, ack, channel, status).await
    }

    async fn save_message(
        &self,
        client_id: &str,
        publish: &Publish,
        status: PendingMessageStatus,
    ) -> Result<(), MqttError> {
        if publish.qos == Qos::AtMostOnce {
            return Ok(());
        }
        let message = PendingMessage::from_publish(publish, status);
        modify_session(self.base.sessions.as_ref(), client_id, move |session| {
            session.save_pending_message(message)
        })
        .await
    }

    async fn remove_pending_message(&self, client_id: &str, packet_id: u16) -> Result<bool, MqttError> {
        modify_session(self.base.sessions.as_ref(), client_id, |session| {
            session.remove_pending_message(packet_id)
        })
        .await
    }

    async fn handle_ack(&self, client_id: &str, packet: Packet, channel: &ChannelRef) -> Result<(), MqttError> {
        match packet {
            Packet::PubAck(ack) => {
                self.remove_pending_message(client_id, ack.packet_id).await?;
                self.packet_ids.provider(client_id).release(ack.packet_id);
                self.complete_inbound(client_id, DispatchClass::FirstAck, ack)
            }
            Packet::PubRec(ack) => {
                self.remove_pending_message(client_id, ack.packet_id).await?;
                let release = Packet::PubRel(Ack::with_order(ack.packet_id, ack.order_id));
                self.base
                    .send_ack(client_id, release, channel, PendingMessageStatus::PendingToSend)
                    .await
            }
            Packet::PubComp(ack) => {
                self.base
                    .remove_pending_acknowledgement(client_id, ack.packet_id, PacketType::PubRel)
                    .await?;
                self.packet_ids.provider(client_id).release(ack.packet_id);
                self.complete_inbound(client_id, DispatchClass::ThirdAck, ack)
            }
            other => {
                trace!("{:?} is not handled by the publish sender", other.packet_type());
                Ok(())
            }
        }
    }

    fn complete_inbound(&self, client_id: &str, class: DispatchClass, ack: Ack) -> Result<(), MqttError> {
        if !ack.order_id.is_nil() {
            let dispatcher = self.base.dispatchers.get_dispatcher(client_id)?;
            complete(&dispatcher, class, ack.order_id);
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolFlow for PublishSenderFlow {
    async fn execute(&self, client_id: &str, packet: Packet, channel: ChannelRef) -> Result<(), MqttError> {
        self.handle_ack(client_id, packet, &channel).await
    }
}
