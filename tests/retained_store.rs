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
use mqtt_engine_tokio::retained_store::RetainedStore;
use mqtt_engine_tokio::Qos;

async fn store_all(store: &RetainedStore, topics: &[&str]) {
    for topic in topics {
        store
            .store(topic, Qos::AtMostOnce, Bytes::from(topic.to_string()))
            .await;
    }
}

fn sorted_topics(messages: &[mqtt_engine_tokio::retained_store::RetainedMessage]) -> Vec<&str> {
    let mut topics: Vec<&str> = messages.iter().map(|m| m.topic.as_str()).collect();
    topics.sort();
    topics
}

#[tokio::test]
async fn test_store_and_retrieve_exact_match() {
    let store = RetainedStore::new();

    store
        .store("sport/tennis/score", Qos::AtLeastOnce, Bytes::from_static(b"15-30"))
        .await;

    let messages = store.get_matching("sport/tennis/score").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].topic, "sport/tennis/score");
    assert_eq!(messages[0].qos, Qos::AtLeastOnce);
    assert_eq!(messages[0].payload, Bytes::from_static(b"15-30"));
}

#[tokio::test]
async fn test_store_overwrite() {
    let store = RetainedStore::new();

    store
        .store("topic/test", Qos::AtMostOnce, Bytes::from_static(b"first"))
        .await;
    store
        .store("topic/test", Qos::ExactlyOnce, Bytes::from_static(b"second"))
        .await;

    // Only the latest message of a topic is retained
    let messages = store.get_matching("topic/test").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].payload, Bytes::from_static(b"second"));
    assert_eq!(messages[0].qos, Qos::ExactlyOnce);
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_remove_message() {
    let store = RetainedStore::new();
    store_all(&store, &["topic/remove", "topic/keep"]).await;

    assert!(store.remove("topic/remove").await);
    assert!(!store.remove("topic/remove").await);
    assert!(!store.remove("topic/never").await);

    assert!(store.get_matching("topic/remove").await.is_empty());
    assert_eq!(store.get_matching("topic/keep").await.len(), 1);
}

#[tokio::test]
async fn test_remove_prunes_to_empty() {
    let store = RetainedStore::new();
    store_all(&store, &["a/b/c"]).await;
    assert!(!store.is_empty().await);

    store.remove("a/b/c").await;
    assert!(store.is_empty().await);
    assert!(store.get_matching("#").await.is_empty());
}

#[tokio::test]
async fn test_single_level_wildcard() {
    let store = RetainedStore::new();
    store_all(
        &store,
        &["sport/tennis/score", "sport/soccer/score", "sport/tennis/player"],
    )
    .await;

    let messages = store.get_matching("sport/+/score").await;
    assert_eq!(
        sorted_topics(&messages),
        vec!["sport/soccer/score", "sport/tennis/score"]
    );
}

#[tokio::test]
async fn test_multi_level_wildcard() {
    let store = RetainedStore::new();
    store_all(&store, &["a/b/c/d", "a/b/c/e", "a/b/f", "x/y/z"]).await;

    let messages = store.get_matching("a/b/#").await;
    assert_eq!(sorted_topics(&messages), vec!["a/b/c/d", "a/b/c/e", "a/b/f"]);
}

#[tokio::test]
async fn test_multi_level_wildcard_matches_parent() {
    let store = RetainedStore::new();
    store_all(&store, &["sport", "sport/tennis"]).await;

    let messages = store.get_matching("sport/#").await;
    assert_eq!(sorted_topics(&messages), vec!["sport", "sport/tennis"]);
}

#[tokio::test]
async fn test_combined_wildcards() {
    let store = RetainedStore::new();
    store_all(&store, &["a/b/c/d", "a/x/c/e", "a/y/c/f", "a/b/z/g"]).await;

    let messages = store.get_matching("a/+/c/#").await;
    assert_eq!(sorted_topics(&messages), vec!["a/b/c/d", "a/x/c/e", "a/y/c/f"]);
}

#[tokio::test]
async fn test_wildcards_skip_dollar_topics() {
    let store = RetainedStore::new();
    store_all(&store, &["$SYS/uptime", "normal/topic"]).await;

    assert_eq!(sorted_topics(&store.get_matching("#").await), vec!["normal/topic"]);
    assert_eq!(store.get_matching("+/uptime").await.len(), 0);
    assert_eq!(store.get_matching("$SYS/uptime").await.len(), 1);
    assert_eq!(store.get_matching("$SYS/#").await.len(), 1);
}

#[tokio::test]
async fn test_empty_levels_are_distinct() {
    let store = RetainedStore::new();
    store_all(&store, &["a//b", "a/b"]).await;

    assert_eq!(sorted_topics(&store.get_matching("a//b").await), vec!["a//b"]);
    assert_eq!(sorted_topics(&store.get_matching("a/+/b").await), vec!["a//b"]);
}

#[tokio::test]
async fn test_retained_publish_carries_retain_flag() {
    let store = RetainedStore::new();
    store
        .store("status", Qos::ExactlyOnce, Bytes::from_static(b"online"))
        .await;

    let messages = store.get_matching("status").await;
    let publish = messages[0].to_publish(Qos::AtLeastOnce);
    assert!(publish.retain);
    assert_eq!(publish.qos, Qos::AtLeastOnce);
    assert_eq!(publish.topic, "status");
    assert_eq!(publish.packet_id, None);
}
