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

//! MQTT 3.1.1 protocol engine on tokio.
//!
//! Every client connection owns a [`ordering::PacketDispatcher`] that writes
//! PUBLISH packets and their acknowledgments in a well defined order, and a set
//! of protocol flows that implement the QoS 0/1/2 handshakes on top of it
//! (retransmission, session persistence, duplicate suppression). The same flows
//! back both the [`server::Server`] and the [`client::Client`].

pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod flows;
pub mod listener;
pub mod ordering;
pub mod packet;
pub mod packet_id;
pub mod retained_store;
pub mod server;
pub mod session_store;
pub mod topic;
pub mod tracing_setup;
pub mod transport;

pub use channel::{ChannelRef, MemoryChannel, PacketChannel};
pub use client::Client;
pub use config::ProtocolConfig;
pub use error::{ClientError, MqttError};
pub use packet::{OrderId, Packet, PacketType, Publish, Qos};
pub use server::Server;

use std::sync::{Mutex, MutexGuard};

/// Lock a std mutex, recovering the data of a poisoned lock. Critical
/// sections in this crate never leave shared state half updated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
