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

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::trace;

use crate::packet::{Publish, Qos};

/// Last retained PUBLISH of a topic
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: String,
    pub qos: Qos,
    pub payload: Bytes,
    pub stored_at: Instant,
}

impl RetainedMessage {
    /// PUBLISH delivering this message to a new subscriber
    pub fn to_publish(&self, qos: Qos) -> Publish {
        Publish::new(self.topic.clone(), qos, self.payload.clone()).with_retain(true)
    }
}

#[derive(Debug, Default)]
struct RetainedTrieNode {
    message: Option<RetainedMessage>,
    children: HashMap<String, RetainedTrieNode>,
}

impl RetainedTrieNode {
    fn is_empty(&self) -> bool {
        self.message.is_none() && self.children.is_empty()
    }
}

/// Retained messages indexed by topic level for wildcard lookups
#[derive(Debug, Clone, Default)]
pub struct RetainedStore {
    root: Arc<RwLock<RetainedTrieNode>>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the retained message of `topic`
    pub async fn store(&self, topic: &str, qos: Qos, payload: Bytes) {
        let mut root = self.root.write().await;
        let mut node = &mut *root;
        for level in topic.split('/') {
            node = node.children.entry(level.to_string()).or_default();
        }
        node.message = Some(RetainedMessage {
            topic: topic.to_string(),
            qos,
            payload,
            stored_at: Instant::now(),
        });
        trace!("Stored retained message for '{topic}' with {qos:?}");
    }

    /// Drop the retained message of `topic` and prune empty branches
    pub async fn remove(&self, topic: &str) -> bool {
        let mut root = self.root.write().await;
        let levels: Vec<&str> = topic.split('/').collect();
        let removed = Self::remove_at(&mut root, &levels);
        if removed {
            trace!("Removed retained message for '{topic}'");
        }
        removed
    }

    fn remove_at(node: &mut RetainedTrieNode, levels: &[&str]) -> bool {
        let Some((first, rest)) = levels.split_first() else {
            return node.message.take().is_some();
        };
        let Some(child) = node.children.get_mut(*first) else {
            return false;
        };
        let removed = Self::remove_at(child, rest);
        if child.is_empty() {
            node.children.remove(*first);
        }
        removed
    }

    /// Retained messages whose topic matches `topic_filter`
    pub async fn get_matching(&self, topic_filter: &str) -> Vec<RetainedMessage> {
        let root = self.root.read().await;
        let levels: Vec<&str> = topic_filter.split('/').collect();
        let mut results = Vec::new();
        Self::collect_matching(&root, &levels, true, &mut results);
        results
    }

    pub async fn len(&self) -> usize {
        let root = self.root.read().await;
        let mut all = Vec::new();
        Self::collect_all(&root, &mut all);
        all.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn collect_matching(
        node: &RetainedTrieNode,
        filter: &[&str],
        top_level: bool,
        results: &mut Vec<RetainedMessage>,
    ) {
        let Some((level, rest)) = filter.split_first() else {
            if let Some(message) = &node.message {
                results.push(message.clone());
            }
            return;
        };

        match *level {
            "#" => {
                // "a/#" also matches "a" itself
                if let Some(message) = &node.message {
                    results.push(message.clone());
                }
                for (name, child) in &node.children {
                    if top_level && name.starts_with('$') {
                        continue;
                    }
                    Self::collect_all(child, results);
                }
            }
            "+" => {
                for (name, child) in &node.children {
                    if top_level && name.starts_with('$') {
                        continue;
                    }
                    Self::collect_matching(child, rest, false, results);
                }
            }
            exact => {
                if let Some(child) = node.children.get(exact) {
                    Self::collect_matching(child, rest, false, results);
                }
            }
        }
    }

    fn collect_all(node: &RetainedTrieNode, results: &mut Vec<RetainedMessage>) {
        if let Some(message) = &node.message {
            results.push(message.clone());
        }
        for child in node.children.values() {
            Self::collect_all(child, results);
        }
    }
}
