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
use tracing::info;

use super::ProtocolFlow;
use crate::channel::ChannelRef;
use crate::connection::ConnectionProvider;
use crate::error::MqttError;
use crate::packet::Packet;

/// Graceful DISCONNECT: the will is discarded and the channel closed
pub struct DisconnectFlow {
    connections: ConnectionProvider,
}

impl DisconnectFlow {
    pub fn new(connections: ConnectionProvider) -> Self {
        Self { connections }
    }
}

#[async_trait]
impl ProtocolFlow for DisconnectFlow {
    async fn execute(&self, client_id: &str, packet: Packet, channel: ChannelRef) -> Result<(), MqttError> {
        if !matches!(packet, Packet::Disconnect) {
            return Ok(());
        }
        info!("Client '{client_id}' sent DISCONNECT");
        self.connections.remove_will(client_id).await;
        channel.close().await;
        Ok(())
    }
}
