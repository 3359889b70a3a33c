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

mod common;

use common::{eventually, test_config, wait_offline, RawPeer, RECV_TIMEOUT, WAIT_TIMEOUT};
use mqtt_engine_tokio::flows::{FlowContext, PublishSenderFlow};
use mqtt_engine_tokio::ordering::{DispatchClass, DispatcherProvider};
use mqtt_engine_tokio::packet::{Ack, SubscribeReturnCode};
use mqtt_engine_tokio::packet_id::PacketIdRegistry;
use mqtt_engine_tokio::session_store::{PendingMessageStatus, SessionStore};
use mqtt_engine_tokio::{
    ChannelRef, MemoryChannel, MqttError, Packet, PacketChannel, Publish, Qos, Server,
};
use std::sync::Arc;
use std::time::Instant;

async fn publish_qos1(publisher: &mut RawPeer, topic: &str, payload: &'static str, packet_id: u16) {
    publisher
        .send(Packet::Publish(
            Publish::new(topic, Qos::AtLeastOnce, payload).with_packet_id(packet_id),
        ))
        .await;
    publisher
        .recv_matching(|packet| matches!(packet, Packet::PubAck(ack) if ack.packet_id == packet_id))
        .await;
}

async fn pending_messages(server: &Server, client_id: &str) -> Vec<(PendingMessageStatus, bool)> {
    server
        .sessions()
        .get(client_id)
        .await
        .map(|session| {
            session
                .pending_messages()
                .iter()
                .map(|pending| (pending.status, pending.dup))
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn test_unacknowledged_qos1_delivery_is_retransmitted_with_dup() {
    let server = Server::new(test_config());
    let (mut subscriber, _) = RawPeer::connect(&server, "subscriber", true).await;
    assert_eq!(
        subscriber.subscribe("t", Qos::AtLeastOnce).await,
        SubscribeReturnCode::MaximumQos1
    );
    let (mut publisher, _) = RawPeer::connect(&server, "publisher", true).await;
    publish_qos1(&mut publisher, "t", "payload", 1).await;

    let first = subscriber.recv_publish().await;
    assert!(!first.dup);
    assert_eq!(first.qos, Qos::AtLeastOnce);
    assert!(first.packet_id.is_some());

    let started = Instant::now();
    let second = subscriber.recv_publish().await;
    let third = subscriber.recv_publish().await;
    let elapsed = started.elapsed();

    for retransmitted in [&second, &third] {
        assert!(retransmitted.dup);
        assert_eq!(retransmitted.packet_id, first.packet_id);
        assert_eq!(retransmitted.payload, first.payload);
    }
    assert!(elapsed >= WAIT_TIMEOUT, "retransmitted too early: {elapsed:?}");
    // Two retransmissions within two intervals, plus scheduling slack
    assert!(
        elapsed < WAIT_TIMEOUT * 2 + WAIT_TIMEOUT / 2,
        "retransmitted too late: {elapsed:?}"
    );

    subscriber.acknowledge(&third).await;
    assert_eq!(subscriber.recv_within(WAIT_TIMEOUT * 3).await, None);
    let server = &server;
    assert!(eventually(|| async move { pending_messages(server, "subscriber").await.is_empty() }).await);
}

#[tokio::test]
async fn test_retransmission_stops_after_max_retries() {
    let server = Server::new(test_config().with_max_retries(Some(1)));
    let (mut subscriber, _) = RawPeer::connect(&server, "subscriber", true).await;
    subscriber.subscribe("t", Qos::AtLeastOnce).await;
    let (mut publisher, _) = RawPeer::connect(&server, "publisher", true).await;
    publish_qos1(&mut publisher, "t", "payload", 1).await;

    let first = subscriber.recv_publish().await;
    let retry = subscriber.recv_publish().await;
    assert!(!first.dup);
    assert!(retry.dup);
    assert_eq!(subscriber.recv_within(WAIT_TIMEOUT * 3).await, None);

    // The message stays pending for a later session resumption
    assert_eq!(
        pending_messages(&server, "subscriber").await,
        vec![(PendingMessageStatus::PendingToAcknowledge, false)]
    );
}

#[tokio::test]
async fn test_offline_subscriber_keeps_message_until_reconnect() {
    let server = Server::new(test_config());
    let (mut subscriber, _) = RawPeer::connect(&server, "subscriber", false).await;
    subscriber.subscribe("t", Qos::AtLeastOnce).await;
    subscriber.send(Packet::Disconnect).await;
    subscriber.wait_closed().await;
    wait_offline(&server, "subscriber").await;

    let (mut publisher, _) = RawPeer::connect(&server, "publisher", true).await;
    publish_qos1(&mut publisher, "t", "kept", 1).await;

    let server_ref = &server;
    assert!(
        eventually(|| async move {
            pending_messages(server_ref, "subscriber").await
                == vec![(PendingMessageStatus::PendingToSend, false)]
        })
        .await
    );

    let (mut subscriber, connack) = RawPeer::connect(&server, "subscriber", false).await;
    assert!(connack.session_present);
    let publish = subscriber.recv_publish().await;
    assert_eq!(publish.topic, "t");
    assert_eq!(publish.payload, "kept");
    assert_eq!(publish.qos, Qos::AtLeastOnce);
    // Never sent before, so not a duplicate
    assert!(!publish.dup);

    subscriber.acknowledge(&publish).await;
    assert!(eventually(|| async move { pending_messages(server_ref, "subscriber").await.is_empty() }).await);
}

#[tokio::test]
async fn test_in_flight_delivery_is_resent_as_duplicate_after_reconnect() {
    let server = Server::new(test_config());
    let (mut subscriber, _) = RawPeer::connect(&server, "subscriber", false).await;
    subscriber.subscribe("t", Qos::AtLeastOnce).await;
    let (mut publisher, _) = RawPeer::connect(&server, "publisher", true).await;
    publish_qos1(&mut publisher, "t", "in-flight", 1).await;

    let original = subscriber.recv_publish().await;
    assert!(!original.dup);
    subscriber.channel.close().await;
    wait_offline(&server, "subscriber").await;
    assert_eq!(
        pending_messages(&server, "subscriber").await,
        vec![(PendingMessageStatus::PendingToAcknowledge, false)]
    );

    let (mut subscriber, connack) = RawPeer::connect(&server, "subscriber", false).await;
    assert!(connack.session_present);
    let resent = subscriber.recv_publish().await;
    assert!(resent.dup);
    assert_eq!(resent.packet_id, original.packet_id);
    assert_eq!(resent.payload, "in-flight");

    subscriber.acknowledge(&resent).await;
    let server = &server;
    assert!(eventually(|| async move { pending_messages(server, "subscriber").await.is_empty() }).await);
}

#[tokio::test]
async fn test_qos2_delivery_clears_session_state() {
    let server = Server::new(test_config());
    let (mut subscriber, _) = RawPeer::connect(&server, "subscriber", true).await;
    assert_eq!(
        subscriber.subscribe("t", Qos::ExactlyOnce).await,
        SubscribeReturnCode::MaximumQos2
    );
    let (mut publisher, _) = RawPeer::connect(&server, "publisher", true).await;

    publisher
        .send(Packet::Publish(
            Publish::new("t", Qos::ExactlyOnce, "payload").with_packet_id(7),
        ))
        .await;
    publisher
        .recv_matching(|packet| matches!(packet, Packet::PubRec(ack) if ack.packet_id == 7))
        .await;

    let delivery = subscriber.recv_publish().await;
    assert_eq!(delivery.qos, Qos::ExactlyOnce);
    assert_eq!(delivery.payload, "payload");
    subscriber.acknowledge(&delivery).await;

    publisher.send(Packet::PubRel(Ack::new(7))).await;
    publisher
        .recv_matching(|packet| matches!(packet, Packet::PubComp(ack) if ack.packet_id == 7))
        .await;

    let server = &server;
    let settled = eventually(|| async move {
        let subscriber = server.sessions().get("subscriber").await;
        let publisher = server.sessions().get("publisher").await;
        subscriber.is_some_and(|session| {
            session.pending_messages().is_empty() && session.pending_acknowledgements().is_empty()
        }) && publisher.is_some_and(|session| session.pending_acknowledgements().is_empty())
    })
    .await;
    assert!(settled);
    assert_eq!(subscriber.recv_within(WAIT_TIMEOUT * 2).await, None);
}

#[tokio::test]
async fn test_pubrel_is_retransmitted_until_pubcomp() {
    let server = Server::new(test_config());
    let (mut subscriber, _) = RawPeer::connect(&server, "subscriber", true).await;
    subscriber.subscribe("t", Qos::ExactlyOnce).await;
    let (publisher, _) = RawPeer::connect(&server, "publisher", true).await;
    publisher
        .send(Packet::Publish(
            Publish::new("t", Qos::ExactlyOnce, "payload").with_packet_id(3),
        ))
        .await;

    let delivery = subscriber.recv_publish().await;
    let packet_id = delivery.packet_id.expect("QoS 2 delivery carries a packet id");
    subscriber.send(Packet::PubRec(Ack::new(packet_id))).await;

    let first = subscriber
        .recv_matching(|packet| matches!(packet, Packet::PubRel(ack) if ack.packet_id == packet_id))
        .await;
    let again = subscriber
        .recv_matching(|packet| matches!(packet, Packet::PubRel(ack) if ack.packet_id == packet_id))
        .await;
    assert_eq!(first.packet_id(), again.packet_id());

    subscriber.send(Packet::PubComp(Ack::new(packet_id))).await;
    let server = &server;
    assert!(
        eventually(|| async move {
            server
                .sessions()
                .get("subscriber")
                .await
                .is_some_and(|session| session.pending_acknowledgements().is_empty())
        })
        .await
    );
}

#[tokio::test]
async fn test_later_delivery_waits_for_earlier_acknowledgement() {
    let server = Server::new(test_config());
    let (mut subscriber, _) = RawPeer::connect(&server, "subscriber", true).await;
    subscriber.subscribe("t", Qos::AtLeastOnce).await;
    let (mut publisher, _) = RawPeer::connect(&server, "publisher", true).await;

    publish_qos1(&mut publisher, "t", "1", 1).await;
    let first = subscriber.recv_publish().await;
    assert_eq!(first.payload, "1");

    publish_qos1(&mut publisher, "t", "2", 2).await;
    // "2" is held back while "1" is unacknowledged
    assert_eq!(subscriber.recv_within(WAIT_TIMEOUT / 4).await, None);

    subscriber.acknowledge(&first).await;
    let second = subscriber
        .recv_matching(|packet| matches!(packet, Packet::Publish(publish) if !publish.dup))
        .await;
    match second {
        Packet::Publish(publish) => assert_eq!(publish.payload, "2"),
        other => panic!("Expected PUBLISH, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_publish_releases_its_order() {
    let dispatchers = Arc::new(DispatcherProvider::new());
    let context = FlowContext {
        config: test_config(),
        sessions: Arc::new(SessionStore::new()),
        dispatchers: dispatchers.clone(),
        packet_ids: Arc::new(PacketIdRegistry::new()),
    };
    let flow = PublishSenderFlow::new(&context);
    let (local, remote) = MemoryChannel::pair();
    let mut received = remote.receiver_stream();
    let channel: ChannelRef = local;

    let dispatcher = dispatchers.get_dispatcher("c").expect("dispatcher");
    let failing = dispatcher.create_order(DispatchClass::Publish).expect("order");
    let following = dispatcher.create_order(DispatchClass::Publish).expect("order");

    // No session exists for "c", so the QoS 1 message cannot be persisted
    let result = flow
        .send_publish(
            "c",
            Publish::new("t", Qos::AtLeastOnce, "lost")
                .with_packet_id(1)
                .with_order(failing),
            Some(channel.clone()),
            PendingMessageStatus::PendingToSend,
        )
        .await;
    assert_eq!(result, Err(MqttError::SessionNotFound("c".to_string())));

    let next = Publish::new("t", Qos::AtMostOnce, "next").with_order(following);
    tokio::time::timeout(
        RECV_TIMEOUT,
        dispatcher.dispatch(Packet::Publish(next), channel.clone()),
    )
    .await
    .expect("Later order stayed blocked")
    .expect("Dispatch failed");

    match tokio::time::timeout(RECV_TIMEOUT, received.recv()).await {
        Ok(Ok(Packet::Publish(publish))) => assert_eq!(publish.payload, "next"),
        other => panic!("Expected the following PUBLISH, got {other:?}"),
    }
    assert_eq!(dispatcher.pending_orders(DispatchClass::Publish), 1);
}
