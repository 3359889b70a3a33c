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

//! Protocol flows.
//!
//! A flow handles one kind of inbound packet for a client. The packet
//! listeners look the flow up through a [`FlowProvider`] and run it on its own
//! task, so a flow waiting for an acknowledgment never blocks the listener.

mod connect;
mod disconnect;
mod ping;
mod publish;
mod publish_receiver;
mod publish_sender;
mod subscribe;

pub(crate) use connect::discard_session;
pub use connect::{ClientConnectFlow, ServerConnectFlow};
pub use disconnect::DisconnectFlow;
pub use ping::PingFlow;
pub use publish::PublishFlow;
pub use publish_receiver::{
    ApplicationMessage, ClientPublishProcessor, PublishProcessor, PublishReceiverFlow,
    ServerPublishProcessor, UndeliveredMessage,
};
pub use publish_sender::PublishSenderFlow;
pub use subscribe::{ServerSubscribeFlow, ServerUnsubscribeFlow};

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::channel::ChannelRef;
use crate::config::ProtocolConfig;
use crate::connection::ConnectionProvider;
use crate::error::MqttError;
use crate::ordering::DispatcherProvider;
use crate::packet::{Packet, PacketType};
use crate::packet_id::PacketIdRegistry;
use crate::retained_store::RetainedStore;
use crate::session_store::SessionRepository;
use crate::topic::TopicEvaluator;

#[async_trait]
pub trait ProtocolFlow: Send + Sync {
    /// Handle `packet` received from `client_id` on `channel`.
    ///
    /// [`MqttError::Protocol`] means the peer violated the protocol; the
    /// listener closes the connection.
    async fn execute(&self, client_id: &str, packet: Packet, channel: ChannelRef) -> Result<(), MqttError>;
}

pub trait FlowProvider: Send + Sync {
    /// Flow handling inbound packets of `packet_type`, if this side accepts them
    fn get_flow(&self, packet_type: PacketType) -> Option<Arc<dyn ProtocolFlow>>;
}

/// Collaborators shared by the flows of one server or client
#[derive(Clone)]
pub struct FlowContext {
    pub config: ProtocolConfig,
    pub sessions: Arc<dyn SessionRepository>,
    pub dispatchers: Arc<DispatcherProvider>,
    pub packet_ids: Arc<PacketIdRegistry>,
}

/// Flows of the server side
pub struct ServerFlows {
    pub connect: Arc<ServerConnectFlow>,
    pub publish_sender: Arc<PublishSenderFlow>,
    pub publish_receiver: Arc<PublishReceiverFlow>,
    pub processor: Arc<ServerPublishProcessor>,
    pub subscribe: Arc<ServerSubscribeFlow>,
    pub unsubscribe: Arc<ServerUnsubscribeFlow>,
    pub ping: Arc<PingFlow>,
    pub disconnect: Arc<DisconnectFlow>,
}

impl ServerFlows {
    pub fn new(
        context: FlowContext,
        connections: ConnectionProvider,
        retained: RetainedStore,
        topics: Arc<dyn TopicEvaluator>,
        undelivered: broadcast::Sender<UndeliveredMessage>,
    ) -> Self {
        let publish_sender = Arc::new(PublishSenderFlow::new(&context));
        let processor = Arc::new(ServerPublishProcessor::new(
            &context,
            publish_sender.clone(),
            connections.clone(),
            retained.clone(),
            topics.clone(),
            undelivered,
        ));
        let publish_receiver = Arc::new(PublishReceiverFlow::new(&context, processor.clone()));

        Self {
            connect: Arc::new(ServerConnectFlow::new(
                &context,
                publish_sender.clone(),
                connections.clone(),
            )),
            subscribe: Arc::new(ServerSubscribeFlow::new(
                &context,
                publish_sender.clone(),
                retained,
                topics,
            )),
            unsubscribe: Arc::new(ServerUnsubscribeFlow::new(&context)),
            ping: Arc::new(PingFlow),
            disconnect: Arc::new(DisconnectFlow::new(connections)),
            publish_sender,
            publish_receiver,
            processor,
        }
    }
}

impl FlowProvider for ServerFlows {
    fn get_flow(&self, packet_type: PacketType) -> Option<Arc<dyn ProtocolFlow>> {
        let flow: Arc<dyn ProtocolFlow> = match packet_type {
            PacketType::Connect => self.connect.clone(),
            PacketType::Publish | PacketType::PubRel => self.publish_receiver.clone(),
            PacketType::PubAck | PacketType::PubRec | PacketType::PubComp => {
                self.publish_sender.clone()
            }
            PacketType::Subscribe => self.subscribe.clone(),
            PacketType::Unsubscribe => self.unsubscribe.clone(),
            PacketType::PingReq => self.ping.clone(),
            PacketType::Disconnect => self.disconnect.clone(),
            _ => return None,
        };
        Some(flow)
    }
}

/// Flows of the client side. SUBACK, UNSUBACK and PINGRESP are awaited by the
/// [`crate::client::Client`] itself and have no flow.
pub struct ClientFlows {
    pub connect: Arc<ClientConnectFlow>,
    pub publish_sender: Arc<PublishSenderFlow>,
    pub publish_receiver: Arc<PublishReceiverFlow>,
}

impl ClientFlows {
    pub fn new(context: FlowContext, messages: broadcast::Sender<ApplicationMessage>) -> Self {
        let publish_sender = Arc::new(PublishSenderFlow::new(&context));
        let processor = Arc::new(ClientPublishProcessor::new(messages));
        Self {
            connect: Arc::new(ClientConnectFlow::new(&context, publish_sender.clone())),
            publish_receiver: Arc::new(PublishReceiverFlow::new(&context, processor)),
            publish_sender,
        }
    }
}

impl FlowProvider for ClientFlows {
    fn get_flow(&self, packet_type: PacketType) -> Option<Arc<dyn ProtocolFlow>> {
        let flow: Arc<dyn ProtocolFlow> = match packet_type {
            PacketType::ConnAck => self.connect.clone(),
            PacketType::Publish | PacketType::PubRel => self.publish_receiver.clone(),
            PacketType::PubAck | PacketType::PubRec | PacketType::PubComp => {
                self.publish_sender.clone()
            }
            _ => return None,
        };
        Some(flow)
    }
}
