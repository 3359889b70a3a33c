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

use std::sync::Mutex;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, trace};

use crate::channel::ChannelRef;
use crate::error::MqttError;
use crate::lock;
use crate::packet::{OrderId, Packet};

const OUTCOME_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOrderState {
    Active,
    Completed,
}

/// Result of sending one item of an order
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub packet: Packet,
    pub error: Option<MqttError>,
}

/// Resolves once the item it was issued for has been drained
pub struct DispatchReceipt(oneshot::Receiver<Result<(), MqttError>>);

impl DispatchReceipt {
    pub async fn wait(self) -> Result<(), MqttError> {
        match self.0.await {
            Ok(result) => result,
            // The order was disposed before the item got drained
            Err(_) => Err(MqttError::Disposed("dispatch order")),
        }
    }
}

struct DispatchOrderItem {
    packet: Packet,
    channel: ChannelRef,
    notify: Option<oneshot::Sender<Result<(), MqttError>>>,
}

struct OrderInner {
    state: DispatchOrderState,
    disposed: bool,
    items: Vec<DispatchOrderItem>,
    /// Index of the first item not yet dispatched
    next_pending: usize,
}

/// Ordered delivery unit for one logical event.
///
/// Items are appended by producers and sent, in append order and at most once
/// each, by [`DispatchOrder::drain`].
pub struct DispatchOrder {
    id: OrderId,
    inner: Mutex<OrderInner>,
    drain_lock: tokio::sync::Mutex<()>,
    outcomes: Mutex<Option<broadcast::Sender<DispatchOutcome>>>,
}

impl DispatchOrder {
    pub fn new(id: OrderId) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CAPACITY);
        Self {
            id,
            inner: Mutex::new(OrderInner {
                state: DispatchOrderState::Active,
                disposed: false,
                items: Vec::new(),
                next_pending: 0,
            }),
            drain_lock: tokio::sync::Mutex::new(()),
            outcomes: Mutex::new(Some(outcomes)),
        }
    }

    pub fn id(&self) -> OrderId {
        self.id
    }

    pub fn state(&self) -> DispatchOrderState {
        lock(&self.inner).state
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.inner).disposed
    }

    /// Number of items appended and not yet dispatched
    pub fn pending_items(&self) -> usize {
        let inner = lock(&self.inner);
        inner.items.len() - inner.next_pending
    }

    pub fn add(&self, packet: Packet, channel: ChannelRef) -> Result<DispatchReceipt, MqttError> {
        let mut inner = lock(&self.inner);
        if inner.disposed {
            return Err(MqttError::Disposed("dispatch order"));
        }
        if inner.state == DispatchOrderState::Completed {
            return Err(MqttError::InvalidState {
                order_id: self.id,
                state: inner.state,
            });
        }

        let (notify, receipt) = oneshot::channel();
        trace!("Order {} appended {:?}", self.id, packet.packet_type());
        inner.items.push(DispatchOrderItem {
            packet,
            channel,
            notify: Some(notify),
        });
        Ok(DispatchReceipt(receipt))
    }

    /// Send every item that has not been dispatched yet. Returns how many
    /// items this call sent.
    ///
    /// Items are marked dispatched before they are written, so concurrent or
    /// repeated drains never send an item twice. Send failures are captured
    /// into the item's outcome instead of failing the drain.
    pub async fn drain(&self) -> Result<usize, MqttError> {
        let _draining = self.drain_lock.lock().await;
        if self.is_disposed() {
            return Err(MqttError::Disposed("dispatch order"));
        }

        let mut sent = 0;
        loop {
            let next = {
                let mut inner = lock(&self.inner);
                if inner.disposed || inner.next_pending >= inner.items.len() {
                    None
                } else {
                    let index = inner.next_pending;
                    inner.next_pending += 1;
                    let item = &mut inner.items[index];
                    Some((item.packet.clone(), item.channel.clone(), item.notify.take()))
                }
            };
            let Some((packet, channel, notify)) = next else {
                break;
            };

            let result = channel.send(packet.clone()).await;
            if let Err(e) = &result {
                debug!("Order {} failed to send {:?}: {e}", self.id, packet.packet_type());
            }
            if let Some(outcomes) = lock(&self.outcomes).as_ref() {
                let _ = outcomes.send(DispatchOutcome {
                    packet,
                    error: result.clone().err(),
                });
            }
            if let Some(notify) = notify {
                let _ = notify.send(result);
            }
            sent += 1;
        }
        Ok(sent)
    }

    pub fn close(&self) -> Result<(), MqttError> {
        let mut inner = lock(&self.inner);
        if inner.disposed {
            return Err(MqttError::Disposed("dispatch order"));
        }
        if inner.state != DispatchOrderState::Completed {
            trace!("Order {} completed", self.id);
            inner.state = DispatchOrderState::Completed;
        }
        Ok(())
    }

    /// Stream of outcomes for items drained from now on
    pub fn subscribe_outcomes(&self) -> Result<broadcast::Receiver<DispatchOutcome>, MqttError> {
        lock(&self.outcomes)
            .as_ref()
            .map(|outcomes| outcomes.subscribe())
            .ok_or(MqttError::Disposed("dispatch order"))
    }

    /// Release every item and end the outcome stream. Producers still waiting
    /// on an undrained item observe [`MqttError::Disposed`].
    pub fn dispose(&self) {
        let items = {
            let mut inner = lock(&self.inner);
            if inner.disposed {
                return;
            }
            inner.disposed = true;
            inner.state = DispatchOrderState::Completed;
            inner.next_pending = 0;
            std::mem::take(&mut inner.items)
        };
        drop(items);
        lock(&self.outcomes).take();
    }
}

impl std::fmt::Debug for DispatchOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchOrder")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("pending_items", &self.pending_items())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MemoryChannel, PacketChannel};
    use crate::packet::{Ack, Publish, Qos};
    use std::sync::Arc;
    use tokio::sync::broadcast::error::RecvError;

    fn publish(packet_id: u16, order_id: OrderId) -> Packet {
        Packet::Publish(
            Publish::new("order/test", Qos::AtLeastOnce, "data")
                .with_packet_id(packet_id)
                .with_order(order_id),
        )
    }

    #[tokio::test]
    async fn new_order_is_active_with_non_nil_id() {
        let order = DispatchOrder::new(OrderId::new_v4());
        assert_eq!(order.state(), DispatchOrderState::Active);
        assert!(!order.id().is_nil());
    }

    #[tokio::test]
    async fn closed_order_rejects_every_add() {
        let (local, _remote) = MemoryChannel::pair();
        let order = DispatchOrder::new(OrderId::new_v4());
        order.close().expect("close");
        // Closing twice is fine
        order.close().expect("second close");

        for packet_id in 1..=3 {
            let result = order.add(publish(packet_id, order.id()), local.clone());
            assert!(matches!(
                result,
                Err(MqttError::InvalidState {
                    state: DispatchOrderState::Completed,
                    ..
                })
            ));
        }
    }

    #[tokio::test]
    async fn repeated_drain_sends_each_item_once() {
        let (local, remote) = MemoryChannel::pair();
        let mut inbound = remote.receiver_stream();
        let order = DispatchOrder::new(OrderId::new_v4());

        let first = order.add(publish(1, order.id()), local.clone()).expect("add");
        let second = order.add(publish(2, order.id()), local.clone()).expect("add");

        assert_eq!(order.drain().await.expect("drain"), 2);
        assert_eq!(order.drain().await.expect("drain"), 0);
        first.wait().await.expect("first sent");
        second.wait().await.expect("second sent");

        let received: Vec<Option<u16>> = vec![
            inbound.try_recv().expect("first").packet_id(),
            inbound.try_recv().expect("second").packet_id(),
        ];
        assert_eq!(received, vec![Some(1), Some(2)]);
        assert!(inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_failure_is_captured_per_item() {
        let (local, _remote) = MemoryChannel::pair();
        local.close().await;

        let order = DispatchOrder::new(OrderId::new_v4());
        let mut outcomes = order.subscribe_outcomes().expect("outcomes");
        let receipt = order
            .add(Packet::PubAck(Ack::with_order(5, order.id())), local.clone())
            .expect("add");

        assert_eq!(order.drain().await.expect("drain"), 1);
        assert_eq!(receipt.wait().await, Err(MqttError::ChannelClosed));

        let outcome = outcomes.recv().await.expect("outcome");
        assert_eq!(outcome.packet.packet_id(), Some(5));
        assert_eq!(outcome.error, Some(MqttError::ChannelClosed));
    }

    #[tokio::test]
    async fn disposed_order_fails_every_operation() {
        let (local, _remote) = MemoryChannel::pair();
        let channel: ChannelRef = local;
        let order = Arc::new(DispatchOrder::new(OrderId::new_v4()));
        let mut outcomes = order.subscribe_outcomes().expect("outcomes");
        let pending = order.add(publish(1, order.id()), channel.clone()).expect("add");

        order.dispose();

        assert_eq!(pending.wait().await, Err(MqttError::Disposed("dispatch order")));
        assert!(matches!(outcomes.recv().await, Err(RecvError::Closed)));
        assert!(matches!(
            order.add(publish(2, order.id()), channel),
            Err(MqttError::Disposed(_))
        ));
        assert!(matches!(order.drain().await, Err(MqttError::Disposed(_))));
        assert!(matches!(order.close(), Err(MqttError::Disposed(_))));
        assert!(order.subscribe_outcomes().is_err());
        assert_eq!(order.pending_items(), 0);
    }
}
