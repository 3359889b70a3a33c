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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::MqttError;
use crate::lock;
use crate::ordering::PacketDispatcher;

/// Owns one [`PacketDispatcher`] per client id
pub struct DispatcherProvider {
    dispatchers: Mutex<HashMap<String, Arc<PacketDispatcher>>>,
    disposed: AtomicBool,
}

impl DispatcherProvider {
    pub fn new() -> Self {
        Self {
            dispatchers: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Dispatcher of `client_id`, created on first use
    pub fn get_dispatcher(&self, client_id: &str) -> Result<Arc<PacketDispatcher>, MqttError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(MqttError::Disposed("dispatcher provider"));
        }
        let mut dispatchers = lock(&self.dispatchers);
        let dispatcher = dispatchers
            .entry(client_id.to_string())
            .or_insert_with(|| {
                debug!("Creating dispatcher for client '{client_id}'");
                Arc::new(PacketDispatcher::new(client_id))
            })
            .clone();
        Ok(dispatcher)
    }

    /// Drop and dispose the dispatcher of `client_id`, if any
    pub fn remove_dispatcher(&self, client_id: &str) {
        let removed = lock(&self.dispatchers).remove(client_id);
        if let Some(dispatcher) = removed {
            dispatcher.dispose();
        }
    }

    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let dispatchers: Vec<_> = lock(&self.dispatchers).drain().map(|(_, d)| d).collect();
        for dispatcher in dispatchers {
            dispatcher.dispose();
        }
    }
}

impl Default for DispatcherProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_client_gets_same_dispatcher() {
        let provider = DispatcherProvider::new();
        let first = provider.get_dispatcher("a").expect("dispatcher");
        let second = provider.get_dispatcher("a").expect("dispatcher");
        let other = provider.get_dispatcher("b").expect("dispatcher");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[tokio::test]
    async fn removed_dispatcher_is_disposed_and_replaced() {
        let provider = DispatcherProvider::new();
        let first = provider.get_dispatcher("a").expect("dispatcher");
        provider.remove_dispatcher("a");
        assert!(first.is_disposed());

        let second = provider.get_dispatcher("a").expect("dispatcher");
        assert!(!second.is_disposed());
    }

    #[tokio::test]
    async fn disposed_provider_disposes_everything() {
        let provider = DispatcherProvider::new();
        let dispatcher = provider.get_dispatcher("a").expect("dispatcher");
        provider.dispose();
        assert!(dispatcher.is_disposed());
        assert!(matches!(
            provider.get_dispatcher("a"),
            Err(MqttError::Disposed(_))
        ));
    }
}
