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

#![allow(dead_code)]

use mqtt_engine_tokio::packet::{
    Ack, ConnAck, Connect, Subscribe, SubscribeReturnCode, Subscription,
};
use mqtt_engine_tokio::{
    MemoryChannel, Packet, PacketChannel, ProtocolConfig, Publish, Qos, Server,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Upper bound for any single expected packet
pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Retransmission interval used by the tests
pub const WAIT_TIMEOUT: Duration = Duration::from_millis(200);

pub fn test_config() -> ProtocolConfig {
    ProtocolConfig::default().with_wait_timeout(WAIT_TIMEOUT)
}

/// Hand written MQTT peer attached to a server over an in-memory channel.
/// Every packet is sent and checked by the test itself.
pub struct RawPeer {
    pub channel: Arc<MemoryChannel>,
    inbound: broadcast::Receiver<Packet>,
}

impl RawPeer {
    pub fn attach(server: &Server) -> Self {
        let (peer_end, server_end) = MemoryChannel::pair();
        let inbound = peer_end.receiver_stream();
        server.accept(server_end);
        Self {
            channel: peer_end,
            inbound,
        }
    }

    /// Attach and complete CONNECT/CONNACK
    pub async fn connect(server: &Server, client_id: &str, clean_session: bool) -> (Self, ConnAck) {
        Self::connect_with(server, Connect::new(client_id, clean_session)).await
    }

    pub async fn connect_with(server: &Server, connect: Connect) -> (Self, ConnAck) {
        let mut peer = Self::attach(server);
        peer.send(Packet::Connect(connect)).await;
        match peer.recv().await {
            Packet::ConnAck(ack) => (peer, ack),
            other => panic!("Expected CONNACK, got {other:?}"),
        }
    }

    pub async fn send(&self, packet: Packet) {
        self.channel
            .send(packet)
            .await
            .expect("Failed to send packet");
    }

    pub async fn recv(&mut self) -> Packet {
        match tokio::time::timeout(RECV_TIMEOUT, self.inbound.recv()).await {
            Ok(Ok(packet)) => packet,
            Ok(Err(e)) => panic!("Channel ended while waiting for a packet: {e}"),
            Err(_) => panic!("No packet received within {RECV_TIMEOUT:?}"),
        }
    }

    /// Next packet within `within`, `None` on silence or a closed channel
    pub async fn recv_within(&mut self, within: Duration) -> Option<Packet> {
        match tokio::time::timeout(within, self.inbound.recv()).await {
            Ok(Ok(packet)) => Some(packet),
            _ => None,
        }
    }

    /// Next packet accepted by `select`, skipping everything else such as
    /// retransmissions
    pub async fn recv_matching(&mut self, select: impl Fn(&Packet) -> bool) -> Packet {
        let wait = async {
            loop {
                match self.inbound.recv().await {
                    Ok(packet) if select(&packet) => return packet,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("Channel ended while waiting for a packet: {e}"),
                }
            }
        };
        tokio::time::timeout(RECV_TIMEOUT, wait)
            .await
            .expect("Expected packet did not arrive")
    }

    pub async fn recv_publish(&mut self) -> Publish {
        match self.recv().await {
            Packet::Publish(publish) => publish,
            other => panic!("Expected PUBLISH, got {other:?}"),
        }
    }

    pub async fn subscribe(&mut self, topic_filter: &str, qos: Qos) -> SubscribeReturnCode {
        let packet_id = 1000;
        self.send(Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions: vec![Subscription {
                topic_filter: topic_filter.to_string(),
                qos,
            }],
        }))
        .await;
        match self.recv().await {
            Packet::SubAck(suback) => {
                assert_eq!(suback.packet_id, packet_id);
                suback.return_codes[0]
            }
            other => panic!("Expected SUBACK, got {other:?}"),
        }
    }

    /// Acknowledge a received PUBLISH the way a well behaved client does
    pub async fn acknowledge(&mut self, publish: &Publish) {
        let Some(packet_id) = publish.packet_id else {
            return;
        };
        match publish.qos {
            Qos::AtMostOnce => {}
            Qos::AtLeastOnce => self.send(Packet::PubAck(Ack::new(packet_id))).await,
            Qos::ExactlyOnce => {
                self.send(Packet::PubRec(Ack::new(packet_id))).await;
                match self.recv().await {
                    Packet::PubRel(ack) => assert_eq!(ack.packet_id, packet_id),
                    other => panic!("Expected PUBREL, got {other:?}"),
                }
                self.send(Packet::PubComp(Ack::new(packet_id))).await;
            }
        }
    }

    /// Wait until the server closed the connection
    pub async fn wait_closed(&mut self) {
        self.wait_closed_within(RECV_TIMEOUT).await
    }

    pub async fn wait_closed_within(&mut self, within: Duration) {
        let closed = async {
            loop {
                match self.inbound.recv().await {
                    Err(broadcast::error::RecvError::Closed) => return,
                    _ => continue,
                }
            }
        };
        tokio::time::timeout(within, closed)
            .await
            .expect("Connection was not closed");
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }
}

/// Wait until the server no longer lists `client_id` as connected
pub async fn wait_offline(server: &Server, client_id: &str) {
    let offline = eventually(|| async move {
        !server.active_clients().await.iter().any(|id| id == client_id)
    })
    .await;
    assert!(offline, "Client '{client_id}' is still connected");
}

/// Poll `condition` until it holds or [`RECV_TIMEOUT`] elapses
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
