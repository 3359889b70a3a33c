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
use tracing::{debug, trace};

use super::publish_sender::PublishSenderFlow;
use super::{FlowContext, ProtocolFlow};
use crate::channel::ChannelRef;
use crate::error::MqttError;
use crate::ordering::DispatchClass;
use crate::packet::{Packet, Qos, SubAck, Subscribe, SubscribeReturnCode, Unsubscribe};
use crate::retained_store::RetainedStore;
use crate::session_store::{modify_session, ClientSubscription, PendingMessageStatus};
use crate::topic::TopicEvaluator;

/// SUBSCRIBE handling on the server
pub struct ServerSubscribeFlow {
    context: FlowContext,
    sender: Arc<PublishSenderFlow>,
    retained: RetainedStore,
    topics: Arc<dyn TopicEvaluator>,
}

impl ServerSubscribeFlow {
    pub fn new(
        context: &FlowContext,
        sender: Arc<PublishSenderFlow>,
        retained: RetainedStore,
        topics: Arc<dyn TopicEvaluator>,
    ) -> Self {
        Self {
            context: context.clone(),
            sender,
            retained,
            topics,
        }
    }

    async fn subscribe(&self, client_id: &str, subscribe: Subscribe, channel: &ChannelRef) -> Result<(), MqttError> {
        let mut return_codes = Vec::with_capacity(subscribe.subscriptions.len());
        let mut granted = Vec::new();

        for subscription in subscribe.subscriptions {
            if !self.topics.is_valid_topic_filter(&subscription.topic_filter) {
                debug!(
                    "Client '{client_id}' sent invalid topic filter '{}'",
                    subscription.topic_filter
                );
                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            }

            let qos = self.context.config.supported_qos(subscription.qos);
            let entry = ClientSubscription {
                client_id: client_id.to_string(),
                topic_filter: subscription.topic_filter.clone(),
                maximum_qos: qos,
            };
            let is_new = modify_session(self.context.sessions.as_ref(), client_id, move |session| {
                session.upsert_subscription(entry)
            })
            .await?;
            trace!(
                "Client '{client_id}' subscribed to '{}' with {qos:?}, is_new={is_new}",
                subscription.topic_filter
            );
            return_codes.push(SubscribeReturnCode::granted(qos));
            granted.push((subscription.topic_filter, qos));
        }

        channel
            .send(Packet::SubAck(SubAck {
                packet_id: subscribe.packet_id,
                return_codes,
            }))
            .await?;

        for (topic_filter, qos) in granted {
            self.send_retained(client_id, &topic_filter, qos, channel).await?;
        }
        Ok(())
    }

    async fn send_retained(
        &self,
        client_id: &str,
        topic_filter: &str,
        granted_qos: Qos,
        channel: &ChannelRef,
    ) -> Result<(), MqttError> {
        let messages = self.retained.get_matching(topic_filter).await;
        if messages.is_empty() {
            return Ok(());
        }
        debug!(
            "Sending {} retained message(s) matching '{topic_filter}' to client '{client_id}'",
            messages.len()
        );

        let dispatcher = self.context.dispatchers.get_dispatcher(client_id)?;
        for message in messages {
            let qos = message.qos.min(granted_qos);
            let mut publish = message.to_publish(qos);
            if qos != Qos::AtMostOnce {
                publish.packet_id = Some(self.context.packet_ids.provider(client_id).get_packet_id()?);
            }
            publish.order_id = dispatcher.create_order(DispatchClass::Publish)?;

            let sender = self.sender.clone();
            let client_id = client_id.to_string();
            let channel = channel.clone();
            tokio::spawn(async move {
                if let Err(e) = sender
                    .send_publish(&client_id, publish, Some(channel), PendingMessageStatus::PendingToSend)
                    .await
                {
                    debug!("Retained delivery to client '{client_id}' ended: {e}");
                }
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolFlow for ServerSubscribeFlow {
    async fn execute(&self, client_id: &str, packet: Packet, channel: ChannelRef) -> Result<(), MqttError> {
        match packet {
            Packet::Subscribe(subscribe) => self.subscribe(client_id, subscribe, &channel).await,
            _ => Ok(()),
        }
    }
}

/// UNSUBSCRIBE handling on the server
pub struct ServerUnsubscribeFlow {
    context: FlowContext,
}

impl ServerUnsubscribeFlow {
    pub fn new(context: &FlowContext) -> Self {
        Self {
            context: context.clone(),
        }
    }

    async fn unsubscribe(&self, client_id: &str, unsubscribe: Unsubscribe, channel: &ChannelRef) -> Result<(), MqttError> {
        let topic_filters = unsubscribe.topic_filters;
        let removed = modify_session(self.context.sessions.as_ref(), client_id, |session| {
            topic_filters
                .iter()
                .filter(|topic_filter| session.remove_subscription(topic_filter))
                .count()
        })
        .await?;
        trace!("Client '{client_id}' removed {removed} subscription(s)");

        channel.send(Packet::UnsubAck(unsubscribe.packet_id)).await
    }
}

#[async_trait]
impl ProtocolFlow for ServerUnsubscribeFlow {
    async fn execute(&self, client_id: &str, packet: Packet, channel: ChannelRef) -> Result<(), MqttError> {
        match packet {
            Packet::Unsubscribe(unsubscribe) => self.unsubscribe(client_id, unsubscribe, &channel).await,
            _ => Ok(()),
        }
    }
}
