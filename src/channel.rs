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

//! Packet channels.
//!
//! A channel moves whole [`Packet`]s between two endpoints. Every packet that
//! arrives is published on the *receiver stream* and every packet that was
//! written is published on the *sender stream*; both are tokio broadcast
//! channels so the listener, QoS monitors and keep-alive supervision can each
//! follow them independently. Both streams end (receivers observe
//! [`broadcast::error::RecvError::Closed`]) once the channel closes.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::MqttError;
use crate::lock;
use crate::packet::Packet;

const STREAM_CAPACITY: usize = 1024;

#[async_trait]
pub trait PacketChannel: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Write one packet. Resolves once the packet has been handed to the
    /// underlying transport.
    async fn send(&self, packet: Packet) -> Result<(), MqttError>;

    /// Stream of inbound packets received from now on
    fn receiver_stream(&self) -> broadcast::Receiver<Packet>;

    /// Stream of outbound packets written from now on
    fn sender_stream(&self) -> broadcast::Receiver<Packet>;

    async fn close(&self);
}

pub type ChannelRef = Arc<dyn PacketChannel>;

/// Identity comparison of two channel handles
pub fn same_channel(a: &ChannelRef, b: &ChannelRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Inbound and outbound broadcast streams of a channel.
///
/// The first inbound subscription is taken when the streams are created and
/// handed to the first caller of `subscribe_inbound`, so packets arriving
/// before the owner of the connection starts listening are not lost.
///
/// Completing the streams drops the senders so that every subscriber sees the
/// end of the stream. Subscribing afterwards yields an already closed receiver.
pub(crate) struct PacketStreams {
    inbound: Mutex<Option<broadcast::Sender<Packet>>>,
    outbound: Mutex<Option<broadcast::Sender<Packet>>>,
    first_inbound: Mutex<Option<broadcast::Receiver<Packet>>>,
}

impl PacketStreams {
    pub(crate) fn new() -> Self {
        let (inbound, first_inbound) = broadcast::channel(STREAM_CAPACITY);
        let (outbound, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            inbound: Mutex::new(Some(inbound)),
            outbound: Mutex::new(Some(outbound)),
            first_inbound: Mutex::new(Some(first_inbound)),
        }
    }

    pub(crate) fn publish_inbound(&self, packet: Packet) {
        if let Some(sender) = lock(&self.inbound).as_ref() {
            // No subscriber means nobody is interested yet
            let _ = sender.send(packet);
        }
    }

    pub(crate) fn publish_outbound(&self, packet: Packet) {
        if let Some(sender) = lock(&self.outbound).as_ref() {
            let _ = sender.send(packet);
        }
    }

    pub(crate) fn subscribe_inbound(&self) -> broadcast::Receiver<Packet> {
        if let Some(first) = lock(&self.first_inbound).take() {
            return first;
        }
        Self::subscribe(&self.inbound)
    }

    pub(crate) fn subscribe_outbound(&self) -> broadcast::Receiver<Packet> {
        Self::subscribe(&self.outbound)
    }

    pub(crate) fn complete(&self) {
        lock(&self.inbound).take();
        lock(&self.outbound).take();
    }

    fn subscribe(slot: &Mutex<Option<broadcast::Sender<Packet>>>) -> broadcast::Receiver<Packet> {
        match lock(slot).as_ref() {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = broadcast::channel(1);
                drop(sender);
                receiver
            }
        }
    }
}

/// In-process channel. [`MemoryChannel::pair`] returns two connected ends;
/// whatever one end sends shows up on the other end's receiver stream.
pub struct MemoryChannel {
    connected: AtomicBool,
    streams: PacketStreams,
    peer: Mutex<Weak<MemoryChannel>>,
}

impl MemoryChannel {
    pub fn pair() -> (Arc<MemoryChannel>, Arc<MemoryChannel>) {
        let left = Arc::new(Self::endpoint());
        let right = Arc::new(Self::endpoint());
        *lock(&left.peer) = Arc::downgrade(&right);
        *lock(&right.peer) = Arc::downgrade(&left);
        (left, right)
    }

    fn endpoint() -> Self {
        Self {
            connected: AtomicBool::new(true),
            streams: PacketStreams::new(),
            peer: Mutex::new(Weak::new()),
        }
    }

    fn shutdown(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            trace!("Memory channel closed");
        }
        self.streams.complete();
    }
}

#[async_trait]
impl PacketChannel for MemoryChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, packet: Packet) -> Result<(), MqttError> {
        if !self.is_connected() {
            return Err(MqttError::ChannelClosed);
        }
        let peer = lock(&self.peer).upgrade().ok_or(MqttError::ChannelClosed)?;
        if !peer.is_connected() {
            return Err(MqttError::ChannelClosed);
        }
        peer.streams.publish_inbound(packet.clone());
        self.streams.publish_outbound(packet);
        Ok(())
    }

    fn receiver_stream(&self) -> broadcast::Receiver<Packet> {
        self.streams.subscribe_inbound()
    }

    fn sender_stream(&self) -> broadcast::Receiver<Packet> {
        self.streams.subscribe_outbound()
    }

    async fn close(&self) {
        self.shutdown();
        let peer = lock(&self.peer).upgrade();
        if let Some(peer) = peer {
            peer.shutdown();
        }
    }
}
