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

use mqtt_engine_tokio::topic::{MqttTopicEvaluator, TopicEvaluator};

#[test]
fn test_valid_topic_filters() {
    let topics = MqttTopicEvaluator::default();
    for filter in ["a", "a/b", "a/+/c", "+", "#", "a/#", "+/+/#", "/", "a//b", "$SYS/#"] {
        assert!(topics.is_valid_topic_filter(filter), "{filter} should be valid");
    }
}

#[test]
fn test_invalid_topic_filters() {
    let topics = MqttTopicEvaluator::default();
    for filter in ["", "a/#/b", "#/a", "a+", "a/b#", "sport+/x", "a\0b"] {
        assert!(!topics.is_valid_topic_filter(filter), "{filter:?} should be invalid");
    }
}

#[test]
fn test_wildcards_can_be_disabled() {
    let topics = MqttTopicEvaluator::new(false);
    assert!(topics.is_valid_topic_filter("a/b"));
    assert!(!topics.is_valid_topic_filter("a/+"));
    assert!(!topics.is_valid_topic_filter("#"));
}

#[test]
fn test_topic_names() {
    let topics = MqttTopicEvaluator::default();
    assert!(topics.is_valid_topic_name("a/b/c"));
    assert!(topics.is_valid_topic_name("/"));
    assert!(!topics.is_valid_topic_name(""));
    assert!(!topics.is_valid_topic_name("a/+"));
    assert!(!topics.is_valid_topic_name("a/#"));
}

#[test]
fn test_matching() {
    let topics = MqttTopicEvaluator::default();
    assert!(topics.matches("sport/tennis/score", "sport/tennis/score"));
    assert!(topics.matches("sport/tennis/score", "sport/+/score"));
    assert!(topics.matches("sport/tennis/score", "sport/#"));
    assert!(topics.matches("sport", "sport/#"));
    assert!(topics.matches("sport/tennis", "#"));
    assert!(topics.matches("/finance", "+/+"));
    assert!(topics.matches("/finance", "/+"));

    assert!(!topics.matches("sport/tennis", "sport/+/score"));
    assert!(!topics.matches("sport/tennis/score", "sport/+"));
    assert!(!topics.matches("sport", "sport/+"));
    assert!(!topics.matches("/finance", "+"));
}

#[test]
fn test_dollar_topics_need_explicit_first_level() {
    let topics = MqttTopicEvaluator::default();
    assert!(!topics.matches("$SYS/uptime", "#"));
    assert!(!topics.matches("$SYS/uptime", "+/uptime"));
    assert!(topics.matches("$SYS/uptime", "$SYS/#"));
    assert!(topics.matches("$SYS/uptime", "$SYS/+"));
}
