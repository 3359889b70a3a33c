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

use std::time::Duration;

use crate::packet::{ConnectReturnCode, OrderId, PacketType};
use crate::ordering::DispatchOrderState;

/// Engine level error.
///
/// Dispatch outcomes are fanned out to several awaiting tasks, so the type is
/// `Clone` and I/O failures are kept as their rendered message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MqttError {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("dispatch order {0} not found")]
    OrderNotFound(OrderId),

    #[error("dispatch order {order_id} is {state:?} and accepts no more packets")]
    InvalidState {
        order_id: OrderId,
        state: DispatchOrderState,
    },

    #[error("{0:?} packets are not dispatched through orders")]
    NotOrderable(PacketType),

    #[error("{0} has been disposed")]
    Disposed(&'static str),

    #[error("session not found for client '{0}'")]
    SessionNotFound(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("no {expected:?} for packet id {packet_id} after {retries} retransmissions")]
    AckRetriesExhausted {
        expected: PacketType,
        packet_id: u16,
        retries: u32,
    },

    #[error("no packet identifier available")]
    PacketIdsExhausted,

    #[error("i/o error: {0}")]
    Io(String),
}

impl MqttError {
    /// Misuse of the ordering machinery. These are never retried.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            MqttError::OrderNotFound(_)
                | MqttError::InvalidState { .. }
                | MqttError::NotOrderable(_)
                | MqttError::Disposed(_)
        )
    }
}

impl From<std::io::Error> for MqttError {
    fn from(e: std::io::Error) -> Self {
        MqttError::Io(e.to_string())
    }
}

/// Error surfaced by the [`crate::client::Client`] facade.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("timed out after {timeout:?} waiting for {waiting_for}")]
    Timeout {
        waiting_for: &'static str,
        timeout: Duration,
    },

    #[error("no {expected:?} for packet id {packet_id} after {retries} retransmissions")]
    Unacknowledged {
        expected: PacketType,
        packet_id: u16,
        retries: u32,
    },

    #[error("connection closed")]
    Disconnected,

    #[error("client is not connected")]
    NotConnected,

    #[error("connection refused: {0:?}")]
    ConnectionRefused(ConnectReturnCode),

    #[error("protocol error: {0}")]
    Protocol(MqttError),
}

impl From<MqttError> for ClientError {
    fn from(e: MqttError) -> Self {
        match e {
            MqttError::ChannelClosed => ClientError::Disconnected,
            MqttError::AckRetriesExhausted {
                expected,
                packet_id,
                retries,
            } => ClientError::Unacknowledged {
                expected,
                packet_id,
                retries,
            },
            other => ClientError::Protocol(other),
        }
    }
}
