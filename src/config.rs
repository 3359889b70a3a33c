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

use crate::packet::Qos;

/// Protocol settings shared by every flow of a server or client
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Highest QoS this endpoint delivers with
    pub maximum_qos: Qos,

    /// Retransmission interval for unacknowledged packets, also the CONNECT and
    /// SUBACK wait limit
    pub wait_timeout: Duration,

    /// Keep alive requested by clients (seconds, 0 disables)
    pub keep_alive_secs: u16,

    /// Retransmission ceiling. `None` retries until the channel disconnects.
    pub max_retries: Option<u32>,

    pub max_packet_size: usize,

    /// Whether topic filters may contain `+` and `#`
    pub allow_wildcards: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            maximum_qos: Qos::ExactlyOnce,
            wait_timeout: Duration::from_secs(5),
            keep_alive_secs: 0,
            max_retries: None,
            max_packet_size: 256 * 1024 * 1024,
            allow_wildcards: true,
        }
    }
}

impl ProtocolConfig {
    pub fn with_maximum_qos(mut self, qos: Qos) -> Self {
        self.maximum_qos = qos;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_keep_alive_secs(mut self, secs: u16) -> Self {
        self.keep_alive_secs = secs;
        self
    }

    pub fn with_max_retries(mut self, retries: Option<u32>) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn with_allow_wildcards(mut self, allow: bool) -> Self {
        self.allow_wildcards = allow;
        self
    }

    /// QoS actually used for a requested level
    pub fn supported_qos(&self, requested: Qos) -> Qos {
        requested.min(self.maximum_qos)
    }

    /// Inbound silence tolerated before a connection is considered dead
    pub fn keep_alive_tolerance(keep_alive_secs: u16) -> Duration {
        Duration::from_secs((f64::from(keep_alive_secs) * 1.5).round() as u64)
    }
}
