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

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::error::MqttError;
use crate::lock;

/// Source of packet identifiers
pub trait PacketIdProvider: Send + Sync {
    /// A non-zero identifier not currently in use
    fn get_packet_id(&self) -> Result<u16, MqttError>;

    /// Mark an identifier as in use, e.g. one restored from a session.
    /// Returns false when it was already taken.
    fn reserve(&self, packet_id: u16) -> bool;

    fn release(&self, packet_id: u16);
}

struct IdState {
    last: u16,
    in_use: HashSet<u16>,
}

/// Hands out identifiers in ascending order, wrapping around and skipping
/// identifiers still in use
pub struct SequentialPacketIdProvider {
    state: Mutex<IdState>,
}

impl SequentialPacketIdProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(IdState {
                last: 0,
                in_use: HashSet::new(),
            }),
        }
    }

    pub fn in_use(&self) -> usize {
        lock(&self.state).in_use.len()
    }
}

impl Default for SequentialPacketIdProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdProvider for SequentialPacketIdProvider {
    fn get_packet_id(&self) -> Result<u16, MqttError> {
        let mut state = lock(&self.state);
        for _ in 0..u16::MAX {
            state.last = state.last.checked_add(1).unwrap_or(1);
            let candidate = state.last;
            if state.in_use.insert(candidate) {
                return Ok(candidate);
            }
        }
        Err(MqttError::PacketIdsExhausted)
    }

    fn reserve(&self, packet_id: u16) -> bool {
        packet_id != 0 && lock(&self.state).in_use.insert(packet_id)
    }

    fn release(&self, packet_id: u16) {
        lock(&self.state).in_use.remove(&packet_id);
    }
}

/// Packet identifiers are scoped to one client; this hands out a provider per
/// client id
#[derive(Default)]
pub struct PacketIdRegistry {
    providers: Mutex<HashMap<String, Arc<SequentialPacketIdProvider>>>,
}

impl PacketIdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider of `client_id`, created on first use
    pub fn provider(&self, client_id: &str) -> Arc<dyn PacketIdProvider> {
        let mut providers = lock(&self.providers);
        let provider = providers
            .entry(client_id.to_string())
            .or_insert_with(|| Arc::new(SequentialPacketIdProvider::new()));
        provider.clone()
    }

    /// Forget every identifier of `client_id`
    pub fn remove(&self, client_id: &str) {
        lock(&self.providers).remove(client_id);
    }
}
