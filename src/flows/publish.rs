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
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use super::FlowContext;
use crate::channel::ChannelRef;
use crate::config::ProtocolConfig;
use crate::error::MqttError;
use crate::ordering::{DispatchClass, DispatcherProvider, PacketDispatcher};
use crate::packet::{OrderId, Packet, PacketType};
use crate::session_store::{
    modify_session, PendingAcknowledgement, PendingMessageStatus, SessionRepository,
};

/// How a retransmission is scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retransmit {
    /// Append to the order of the original packet, which is still active
    SameOrder,
    /// Send in a new order of the packet's class, completed right away
    FreshOrder,
}

/// Acknowledgment bookkeeping and the retry monitor shared by the sending and
/// receiving publish flows
pub struct PublishFlow {
    pub(crate) config: ProtocolConfig,
    pub(crate) sessions: Arc<dyn SessionRepository>,
    pub(crate) dispatchers: Arc<DispatcherProvider>,
}

impl PublishFlow {
    pub fn new(context: &FlowContext) -> Self {
        Self {
            config: context.config.clone(),
            sessions: context.sessions.clone(),
            dispatchers: context.dispatchers.clone(),
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Send a PUBACK, PUBREC, PUBREL or PUBCOMP that already carries its order
    /// id and follow its handshake through.
    ///
    /// PUBREC and PUBREL are recorded as pending acknowledgments when `status`
    /// is [`PendingMessageStatus::PendingToSend`]. A PUBREL keeps its order
    /// open until PUBCOMP arrives; a PUBREC completes its order once written
    /// and is retransmitted in fresh orders until PUBREL arrives.
    pub async fn send_ack(
        &self,
        client_id: &str,
        ack: Packet,
        channel: &ChannelRef,
        status: PendingMessageStatus,
    ) -> Result<(), MqttError> {
        match self.dispatch_ack(client_id, &ack, channel, status).await? {
            Some(inbound) => self.monitor_ack_response(client_id, ack, channel, inbound).await,
            None => Ok(()),
        }
    }

    /// First half of [`PublishFlow::send_ack`]: record, dispatch and complete
    /// the order where nothing else follows in it. Returns the inbound stream
    /// (subscribed before the write) to wait for the response on, or `None`
    /// when the channel is gone.
    pub(crate) async fn dispatch_ack(
        &self,
        client_id: &str,
        ack: &Packet,
        channel: &ChannelRef,
        status: PendingMessageStatus,
    ) -> Result<Option<broadcast::Receiver<Packet>>, MqttError> {
        let packet_type = ack.packet_type();
        let class = DispatchClass::of(packet_type).ok_or(MqttError::NotOrderable(packet_type))?;
        let order_id = ack.order_id().unwrap_or_default();
        let packet_id = ack.packet_id().unwrap_or_default();

        if matches!(packet_type, PacketType::PubRec | PacketType::PubRel)
            && status == PendingMessageStatus::PendingToSend
        {
            self.save_pending_acknowledgement(
                client_id,
                PendingAcknowledgement::new(packet_id, packet_type),
            )
            .await?;
        }

        let dispatcher = self.dispatchers.get_dispatcher(client_id)?;
        if !channel.is_connected() {
            debug!("Client '{client_id}' is offline, {packet_type:?} for packet id {packet_id} not sent");
            complete(&dispatcher, class, order_id);
            return Ok(None);
        }

        let inbound = channel.receiver_stream();
        let sent = self.dispatch(&dispatcher, client_id, ack.clone(), channel).await;
        if packet_type != PacketType::PubRel || sent.is_err() {
            complete(&dispatcher, class, order_id);
        }
        sent?;
        Ok(Some(inbound))
    }

    /// Second half of [`PublishFlow::send_ack`]
    pub(crate) async fn monitor_ack_response(
        &self,
        client_id: &str,
        ack: Packet,
        channel: &ChannelRef,
        inbound: broadcast::Receiver<Packet>,
    ) -> Result<(), MqttError> {
        match ack.packet_type() {
            PacketType::PubRec => {
                self.monitor_ack(client_id, ack, channel, inbound, PacketType::PubRel, Retransmit::FreshOrder)
                    .await
            }
            PacketType::PubRel => {
                let order_id = ack.order_id().unwrap_or_default();
                let result = self
                    .monitor_ack(client_id, ack, channel, inbound, PacketType::PubComp, Retransmit::SameOrder)
                    .await;
                if let Ok(dispatcher) = self.dispatchers.get_dispatcher(client_id) {
                    complete(&dispatcher, DispatchClass::SecondAck, order_id);
                }
                result
            }
            _ => Ok(()),
        }
    }

    /// Dispatch through `dispatcher`. Write failures are logged and left to
    /// the retry monitor; only misuse of the dispatcher is returned.
    pub(crate) async fn dispatch(
        &self,
        dispatcher: &PacketDispatcher,
        client_id: &str,
        packet: Packet,
        channel: &ChannelRef,
    ) -> Result<(), MqttError> {
        let packet_type = packet.packet_type();
        match dispatcher.dispatch(packet, channel.clone()).await {
            Err(e) if e.is_contract_violation() => Err(e),
            Err(e) => {
                debug!("Failed to send {packet_type:?} to client '{client_id}': {e}");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// Wait for the `expected` packet answering `sent`, retransmitting `sent`
    /// every wait timeout while the channel stays connected.
    ///
    /// `inbound` must have been subscribed before `sent` was first written.
    pub(crate) async fn monitor_ack(
        &self,
        client_id: &str,
        sent: Packet,
        channel: &ChannelRef,
        mut inbound: broadcast::Receiver<Packet>,
        expected: PacketType,
        retransmit: Retransmit,
    ) -> Result<(), MqttError> {
        let packet_id = sent.packet_id().unwrap_or_default();
        let mut retries = 0u32;

        loop {
            tokio::select! {
                received = wait_for_packet(&mut inbound, expected, packet_id) => {
                    if received.is_ok() {
                        trace!("Client '{client_id}' answered packet id {packet_id} with {expected:?}");
                    }
                    return received.map(|_| ());
                }
                _ = tokio::time::sleep(self.config.wait_timeout) => {
                    if !channel.is_connected() {
                        debug!("Stopped waiting for {expected:?} {packet_id} from disconnected client '{client_id}'");
                        return Err(MqttError::ChannelClosed);
                    }
                    if self.config.max_retries.is_some_and(|max| retries >= max) {
                        return Err(MqttError::AckRetriesExhausted {
                            expected,
                            packet_id,
                            retries,
                        });
                    }
                    retries += 1;
                    warn!(
                        "No {expected:?} from client '{client_id}' for packet id {packet_id}, retransmitting {:?} (attempt {retries})",
                        sent.packet_type()
                    );
                    self.retransmit(client_id, &sent, channel, retransmit).await?;
                }
            }
        }
    }

    async fn retransmit(
        &self,
        client_id: &str,
        sent: &Packet,
        channel: &ChannelRef,
        retransmit: Retransmit,
    ) -> Result<(), MqttError> {
        let dispatcher = self.dispatchers.get_dispatcher(client_id)?;
        let mut packet = sent.clone();
        if let Packet::Publish(publish) = &mut packet {
            publish.dup = true;
        }

        match retransmit {
            Retransmit::SameOrder => self.dispatch(&dispatcher, client_id, packet, channel).await,
            Retransmit::FreshOrder => {
                let packet_type = packet.packet_type();
                let class = DispatchClass::of(packet_type).ok_or(MqttError::NotOrderable(packet_type))?;
                let order_id = dispatcher.create_order(class)?;
                packet.reassign_order(order_id)?;
                let sent = self.dispatch(&dispatcher, client_id, packet, channel).await;
                complete(&dispatcher, class, order_id);
                sent
            }
        }
    }

    pub(crate) async fn save_pending_acknowledgement(
        &self,
        client_id: &str,
        ack: PendingAcknowledgement,
    ) -> Result<(), MqttError> {
        modify_session(self.sessions.as_ref(), client_id, |session| {
            session.add_pending_acknowledgement(ack)
        })
        .await
    }

    pub(crate) async fn remove_pending_acknowledgement(
        &self,
        client_id: &str,
        packet_id: u16,
        packet_type: PacketType,
    ) -> Result<bool, MqttError> {
        modify_session(self.sessions.as_ref(), client_id, |session| {
            session.remove_pending_acknowledgement(packet_id, packet_type)
        })
        .await
    }
}

/// Complete an order, ignoring a dispatcher that was disposed meanwhile
pub(crate) fn complete(dispatcher: &PacketDispatcher, class: DispatchClass, order_id: OrderId) {
    if let Err(e) = dispatcher.complete_order(class, order_id) {
        trace!("Order {order_id} of client '{}' not completed: {e}", dispatcher.client_id());
    }
}

/// Next inbound packet of `packet_type` carrying `packet_id`
pub(crate) async fn wait_for_packet(
    inbound: &mut broadcast::Receiver<Packet>,
    packet_type: PacketType,
    packet_id: u16,
) -> Result<Packet, MqttError> {
    loop {
        match inbound.recv().await {
            Ok(packet)
                if packet.packet_type() == packet_type && packet.packet_id() == Some(packet_id) =>
            {
                return Ok(packet);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Missed {skipped} inbound packet(s) while waiting for {packet_type:?} {packet_id}");
            }
            Err(broadcast::error::RecvError::Closed) => return Err(MqttError::ChannelClosed),
        }
    }
}
