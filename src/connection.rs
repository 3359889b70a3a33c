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

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::trace;

use crate::channel::{same_channel, ChannelRef};
use crate::packet::Will;

/// Live channels and stored wills, keyed by client id
#[derive(Clone, Default)]
pub struct ConnectionProvider {
    connections: Arc<RwLock<HashMap<String, ChannelRef>>>,
    wills: Arc<RwLock<HashMap<String, Will>>>,
}

impl ConnectionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `channel` for `client_id`, returning the channel it replaces
    pub async fn add_connection(&self, client_id: &str, channel: ChannelRef) -> Option<ChannelRef> {
        let mut connections = self.connections.write().await;
        trace!("Registering connection for client '{client_id}'");
        connections
            .insert(client_id.to_string(), channel.clone())
            .filter(|previous| !same_channel(previous, &channel))
    }

    /// Connected channel of `client_id`
    pub async fn get_connection(&self, client_id: &str) -> Option<ChannelRef> {
        let connections = self.connections.read().await;
        connections
            .get(client_id)
            .filter(|channel| channel.is_connected())
            .cloned()
    }

    /// Forget the connection of `client_id` if it is still `channel`. A client
    /// that already reconnected on another channel is left alone.
    pub async fn remove_connection(&self, client_id: &str, channel: &ChannelRef) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(client_id) {
            Some(current) if same_channel(current, channel) => {
                connections.remove(client_id);
                trace!("Removed connection of client '{client_id}'");
                true
            }
            _ => false,
        }
    }

    pub async fn active_clients(&self) -> Vec<String> {
        let connections = self.connections.read().await;
        connections
            .iter()
            .filter(|(_, channel)| channel.is_connected())
            .map(|(client_id, _)| client_id.clone())
            .collect()
    }

    /// Close every registered channel
    pub async fn close_all(&self) {
        let channels: Vec<ChannelRef> = self.connections.read().await.values().cloned().collect();
        for channel in channels {
            channel.close().await;
        }
    }

    pub async fn set_will(&self, client_id: &str, will: Will) {
        self.wills.write().await.insert(client_id.to_string(), will);
    }

    pub async fn take_will(&self, client_id: &str) -> Option<Will> {
        self.wills.write().await.remove(client_id)
    }

    pub async fn remove_will(&self, client_id: &str) {
        if self.wills.write().await.remove(client_id).is_some() {
            trace!("Discarded will of client '{client_id}'");
        }
    }
}
