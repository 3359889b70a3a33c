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

/// Topic name and topic filter rules
pub trait TopicEvaluator: Send + Sync {
    fn is_valid_topic_filter(&self, topic_filter: &str) -> bool;

    fn is_valid_topic_name(&self, topic_name: &str) -> bool;

    /// Whether `topic_name` is selected by `topic_filter`
    fn matches(&self, topic_name: &str, topic_filter: &str) -> bool;
}

/// MQTT 3.1.1 topic rules
#[derive(Debug, Clone)]
pub struct MqttTopicEvaluator {
    allow_wildcards: bool,
}

impl MqttTopicEvaluator {
    pub fn new(allow_wildcards: bool) -> Self {
        Self { allow_wildcards }
    }
}

impl Default for MqttTopicEvaluator {
    fn default() -> Self {
        Self::new(true)
    }
}

impl TopicEvaluator for MqttTopicEvaluator {
    fn is_valid_topic_filter(&self, topic_filter: &str) -> bool {
        if topic_filter.is_empty() || topic_filter.contains('\0') {
            return false;
        }

        let level_count = topic_filter.split('/').count();
        for (i, level) in topic_filter.split('/').enumerate() {
            match level {
                "#" => {
                    // # must be the last level
                    if !self.allow_wildcards || i != level_count - 1 {
                        return false;
                    }
                }
                "+" => {
                    if !self.allow_wildcards {
                        return false;
                    }
                }
                other if other.contains('+') || other.contains('#') => return false,
                _ => {}
            }
        }
        true
    }

    fn is_valid_topic_name(&self, topic_name: &str) -> bool {
        !topic_name.is_empty()
            && !topic_name.contains('+')
            && !topic_name.contains('#')
            && !topic_name.contains('\0')
    }

    fn matches(&self, topic_name: &str, topic_filter: &str) -> bool {
        // Wildcards at the first level never select "$" topics
        if topic_name.starts_with('$')
            && (topic_filter.starts_with('+') || topic_filter.starts_with('#'))
        {
            return false;
        }

        let mut names = topic_name.split('/');
        let mut filters = topic_filter.split('/');
        loop {
            match (filters.next(), names.next()) {
                (Some("#"), _) => return true,
                (Some("+"), Some(_)) => {}
                (Some(filter), Some(name)) if filter == name => {}
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}
