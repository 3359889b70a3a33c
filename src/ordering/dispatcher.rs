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

use futures::future;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::channel::ChannelRef;
use crate::error::MqttError;
use crate::lock;
use crate::ordering::dispatch_order::{DispatchOrder, DispatchOrderState};
use crate::packet::{OrderId, Packet, PacketType};

/// Independent FIFO queues kept per client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchClass {
    /// PUBLISH
    Publish,
    /// PUBACK and PUBREC
    FirstAck,
    /// PUBREL
    SecondAck,
    /// PUBCOMP
    ThirdAck,
}

impl DispatchClass {
    pub const ALL: [DispatchClass; 4] = [
        DispatchClass::Publish,
        DispatchClass::FirstAck,
        DispatchClass::SecondAck,
        DispatchClass::ThirdAck,
    ];

    pub fn of(packet_type: PacketType) -> Option<Self> {
        match packet_type {
            PacketType::Publish => Some(DispatchClass::Publish),
            PacketType::PubAck | PacketType::PubRec => Some(DispatchClass::FirstAck),
            PacketType::PubRel => Some(DispatchClass::SecondAck),
            PacketType::PubComp => Some(DispatchClass::ThirdAck),
            _ => None,
        }
    }

    fn index(self) -> usize {
        match self {
            DispatchClass::Publish => 0,
            DispatchClass::FirstAck => 1,
            DispatchClass::SecondAck => 2,
            DispatchClass::ThirdAck => 3,
        }
    }
}

struct DispatcherShared {
    client_id: String,
    queues: [Mutex<VecDeque<Arc<DispatchOrder>>>; 4],
    wake: Notify,
    disposed: AtomicBool,
}

impl DispatcherShared {
    fn queue(&self, class: DispatchClass) -> &Mutex<VecDeque<Arc<DispatchOrder>>> {
        &self.queues[class.index()]
    }

    fn find_order(&self, class: DispatchClass, order_id: OrderId) -> Option<Arc<DispatchOrder>> {
        lock(self.queue(class))
            .iter()
            .find(|order| order.id() == order_id)
            .cloned()
    }
}

/// Per-client packet dispatcher.
///
/// Producers create orders, dispatch packets into them and complete them; a
/// single background task drains the head order of every class onto its
/// channel and only moves on once that head is completed. Packets of a later
/// order therefore never overtake packets of an earlier one within a class.
///
/// Must be created inside a tokio runtime.
pub struct PacketDispatcher {
    shared: Arc<DispatcherShared>,
}

impl PacketDispatcher {
    pub fn new(client_id: impl Into<String>) -> Self {
        let shared = Arc::new(DispatcherShared {
            client_id: client_id.into(),
            queues: Default::default(),
            wake: Notify::new(),
            disposed: AtomicBool::new(false),
        });
        tokio::spawn(drain_loop(shared.clone()));
        Self { shared }
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    fn ensure_alive(&self) -> Result<(), MqttError> {
        if self.is_disposed() {
            Err(MqttError::Disposed("packet dispatcher"))
        } else {
            Ok(())
        }
    }

    /// Enqueue a fresh active order at the tail of `class`
    pub fn create_order(&self, class: DispatchClass) -> Result<OrderId, MqttError> {
        self.ensure_alive()?;
        let order_id = {
            let mut queue = lock(self.shared.queue(class));
            let order_id = loop {
                let candidate = OrderId::new_v4();
                if !candidate.is_nil() && queue.iter().all(|order| order.id() != candidate) {
                    break candidate;
                }
            };
            queue.push_back(Arc::new(DispatchOrder::new(order_id)));
            order_id
        };
        trace!(
            "Client '{}' created {class:?} order {order_id}",
            self.shared.client_id
        );
        self.shared.wake.notify_one();
        Ok(order_id)
    }

    /// Append `packet` to the order named by its order id and wait until it
    /// has been written (or failed) on `channel`.
    pub async fn dispatch(&self, packet: Packet, channel: ChannelRef) -> Result<(), MqttError> {
        self.ensure_alive()?;
        let packet_type = packet.packet_type();
        let class = DispatchClass::of(packet_type).ok_or(MqttError::NotOrderable(packet_type))?;
        let order_id = packet.order_id().unwrap_or_default();
        let order = self
            .shared
            .find_order(class, order_id)
            .ok_or(MqttError::OrderNotFound(order_id))?;

        let receipt = order.add(packet, channel)?;
        self.shared.wake.notify_one();
        receipt.wait().await
    }

    /// Mark an order completed. Unknown orders are ignored.
    pub fn complete_order(&self, class: DispatchClass, order_id: OrderId) -> Result<(), MqttError> {
        self.ensure_alive()?;
        if let Some(order) = self.shared.find_order(class, order_id) {
            order.close()?;
            self.shared.wake.notify_one();
        }
        Ok(())
    }

    /// Orders currently queued in `class`
    pub fn pending_orders(&self, class: DispatchClass) -> usize {
        lock(self.shared.queue(class)).len()
    }

    /// Complete and drop every queued order and stop the drain task
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        for class in DispatchClass::ALL {
            let orders: Vec<_> = lock(self.shared.queue(class)).drain(..).collect();
            for order in orders {
                order.dispose();
            }
        }
        self.shared.wake.notify_one();
        debug!("Dispatcher for client '{}' disposed", self.shared.client_id);
    }
}

impl Drop for PacketDispatcher {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn drain_loop(shared: Arc<DispatcherShared>) {
    trace!("Dispatcher for client '{}' started", shared.client_id);
    while !shared.disposed.load(Ordering::SeqCst) {
        let progress = future::join_all(
            DispatchClass::ALL
                .into_iter()
                .map(|class| drain_head(&shared, class)),
        )
        .await;
        if !progress.into_iter().any(|made_progress| made_progress) {
            shared.wake.notified().await;
        }
    }
    trace!("Dispatcher for client '{}' stopped", shared.client_id);
}

/// Drain the head order of `class`, dequeuing it once completed. Returns
/// whether anything was sent or dequeued.
async fn drain_head(shared: &DispatcherShared, class: DispatchClass) -> bool {
    let head = lock(shared.queue(class)).front().cloned();
    let Some(order) = head else {
        return false;
    };

    let sent = order.drain().await.unwrap_or(0);
    if order.state() != DispatchOrderState::Completed {
        return sent > 0;
    }

    // Items appended between the drain above and the close are still pending
    let _ = order.drain().await;
    {
        let mut queue = lock(shared.queue(class));
        if queue.front().is_some_and(|front| Arc::ptr_eq(front, &order)) {
            queue.pop_front();
        }
    }
    trace!(
        "Client '{}' {class:?} order {} dequeued",
        shared.client_id,
        order.id()
    );
    order.dispose();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MemoryChannel, PacketChannel};
    use crate::packet::{Ack, Publish, Qos};
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio::time::{sleep, timeout};

    fn publish(packet_id: u16, order_id: OrderId) -> Packet {
        Packet::Publish(
            Publish::new("dispatch/test", Qos::AtLeastOnce, "data")
                .with_packet_id(packet_id)
                .with_order(order_id),
        )
    }

    async fn next_packet(inbound: &mut broadcast::Receiver<Packet>) -> Packet {
        timeout(Duration::from_secs(2), inbound.recv())
            .await
            .expect("packet within timeout")
            .expect("stream open")
    }

    #[tokio::test]
    async fn dispatch_into_unknown_order_fails() {
        let (local, _remote) = MemoryChannel::pair();
        let dispatcher = PacketDispatcher::new("client");

        let result = dispatcher.dispatch(publish(1, OrderId::nil()), local.clone()).await;
        assert_eq!(result, Err(MqttError::OrderNotFound(OrderId::nil())));

        let unknown = OrderId::new_v4();
        let result = dispatcher.dispatch(publish(1, unknown), local.clone()).await;
        assert_eq!(result, Err(MqttError::OrderNotFound(unknown)));
    }

    #[tokio::test]
    async fn later_order_waits_for_earlier_order_to_complete() {
        let (local, remote) = MemoryChannel::pair();
        let mut inbound = remote.receiver_stream();
        let dispatcher = Arc::new(PacketDispatcher::new("client"));

        let first = dispatcher.create_order(DispatchClass::Publish).expect("order");
        let second = dispatcher.create_order(DispatchClass::Publish).expect("order");

        // The second order gets its packet before the first one
        let second_task = {
            let dispatcher = dispatcher.clone();
            let channel: ChannelRef = local.clone();
            tokio::spawn(async move { dispatcher.dispatch(publish(2, second), channel).await })
        };
        sleep(Duration::from_millis(50)).await;
        assert!(inbound.try_recv().is_err());

        dispatcher
            .dispatch(publish(1, first), local.clone())
            .await
            .expect("first dispatched");
        assert_eq!(next_packet(&mut inbound).await.packet_id(), Some(1));

        sleep(Duration::from_millis(50)).await;
        assert!(inbound.try_recv().is_err());
        assert!(!second_task.is_finished());

        dispatcher
            .complete_order(DispatchClass::Publish, first)
            .expect("complete");
        assert_eq!(next_packet(&mut inbound).await.packet_id(), Some(2));
        second_task
            .await
            .expect("join")
            .expect("second dispatched");
    }

    #[tokio::test]
    async fn completing_orders_releases_them_in_sequence() {
        let (local, remote) = MemoryChannel::pair();
        let mut inbound = remote.receiver_stream();
        let dispatcher = Arc::new(PacketDispatcher::new("client"));

        let orders: Vec<OrderId> = (0..10)
            .map(|_| dispatcher.create_order(DispatchClass::Publish).expect("order"))
            .collect();

        let mut tasks = Vec::new();
        let mut packet_id = 1u16;
        for order_id in &orders {
            for _ in 0..2 {
                let dispatcher = dispatcher.clone();
                let channel: ChannelRef = local.clone();
                let packet = publish(packet_id, *order_id);
                packet_id += 1;
                tasks.push(tokio::spawn(async move {
                    dispatcher.dispatch(packet, channel).await
                }));
            }
        }
        // Let every producer append its packet before orders get closed
        sleep(Duration::from_millis(50)).await;

        for order_id in orders.iter().take(5) {
            dispatcher
                .complete_order(DispatchClass::Publish, *order_id)
                .expect("complete");
        }

        // Five completed orders plus the active head
        for _ in 0..(5 + 1) * 2 {
            next_packet(&mut inbound).await;
        }
        sleep(Duration::from_millis(50)).await;
        assert!(inbound.try_recv().is_err());
        assert_eq!(dispatcher.pending_orders(DispatchClass::Publish), 5);

        dispatcher.dispose();
        let mut disposed = 0;
        for task in tasks {
            if let Err(MqttError::Disposed(_)) = task.await.expect("join") {
                disposed += 1;
            }
        }
        assert_eq!(disposed, 4 * 2);
    }

    #[tokio::test]
    async fn classes_are_ordered_independently() {
        let (local, remote) = MemoryChannel::pair();
        let mut inbound = remote.receiver_stream();
        let dispatcher = PacketDispatcher::new("client");

        // An open publish order does not hold back acknowledgments
        let _blocking = dispatcher.create_order(DispatchClass::Publish).expect("order");
        let blocked = dispatcher.create_order(DispatchClass::Publish).expect("order");
        let ack_order = dispatcher.create_order(DispatchClass::FirstAck).expect("order");

        let pending = dispatcher.dispatch(publish(1, blocked), local.clone());
        tokio::pin!(pending);
        assert!(timeout(Duration::from_millis(50), &mut pending).await.is_err());

        dispatcher
            .dispatch(Packet::PubAck(Ack::with_order(9, ack_order)), local.clone())
            .await
            .expect("ack dispatched");
        assert_eq!(
            next_packet(&mut inbound).await,
            Packet::PubAck(Ack::with_order(9, ack_order))
        );
    }

    #[tokio::test]
    async fn send_failure_reaches_the_caller() {
        let (local, _remote) = MemoryChannel::pair();
        local.close().await;
        let dispatcher = PacketDispatcher::new("client");
        let order_id = dispatcher.create_order(DispatchClass::ThirdAck).expect("order");

        let result = dispatcher
            .dispatch(Packet::PubComp(Ack::with_order(3, order_id)), local.clone())
            .await;
        assert_eq!(result, Err(MqttError::ChannelClosed));
    }

    #[tokio::test]
    async fn disposed_dispatcher_rejects_operations() {
        let (local, _remote) = MemoryChannel::pair();
        let dispatcher = PacketDispatcher::new("client");
        let order_id = dispatcher.create_order(DispatchClass::Publish).expect("order");
        dispatcher.dispose();

        assert!(dispatcher.is_disposed());
        assert_eq!(dispatcher.pending_orders(DispatchClass::Publish), 0);
        assert!(matches!(
            dispatcher.create_order(DispatchClass::Publish),
            Err(MqttError::Disposed(_))
        ));
        assert!(matches!(
            dispatcher.dispatch(publish(1, order_id), local.clone()).await,
            Err(MqttError::Disposed(_))
        ));
    }
}
