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

use mqtt_engine_tokio::packet::PacketType;
use mqtt_engine_tokio::session_store::{
    modify_session, ClientSession, PendingAcknowledgement, SessionRepository, SessionStore,
};
use mqtt_engine_tokio::MqttError;

#[tokio::test]
async fn test_modify_changes_stored_session() {
    let store = SessionStore::new();
    store
        .create(ClientSession::new("c1", false))
        .await
        .expect("Failed to create session");

    let mut calls = 0;
    store
        .modify("c1", &mut |session| {
            calls += 1;
            session.add_pending_acknowledgement(PendingAcknowledgement::new(3, PacketType::PubRec));
        })
        .await
        .expect("Failed to modify session");
    assert_eq!(calls, 1);

    let session = store.get("c1").await.expect("session");
    assert!(session.has_pending_acknowledgement(3, PacketType::PubRec));
}

#[tokio::test]
async fn test_modify_session_returns_closure_result() {
    let store = SessionStore::new();
    store
        .create(ClientSession::new("c1", false))
        .await
        .expect("Failed to create session");

    let added = modify_session(&store, "c1", |session| {
        session.add_pending_acknowledgement(PendingAcknowledgement::new(9, PacketType::PubRel));
        session.pending_acknowledgements().len()
    })
    .await
    .expect("Failed to modify session");
    assert_eq!(added, 1);

    let removed = modify_session(&store, "c1", |session| {
        session.remove_pending_acknowledgement(9, PacketType::PubRel)
    })
    .await
    .expect("Failed to modify session");
    assert!(removed);
}

#[tokio::test]
async fn test_modify_of_missing_session_fails() {
    let store = SessionStore::new();
    let result = modify_session(&store, "nobody", |session| session.clean).await;
    assert_eq!(result, Err(MqttError::SessionNotFound("nobody".to_string())));
}

#[tokio::test]
async fn test_update_requires_existing_session() {
    let store = SessionStore::new();
    assert_eq!(
        store.update(ClientSession::new("c1", true)).await,
        Err(MqttError::SessionNotFound("c1".to_string()))
    );

    store
        .create(ClientSession::new("c1", true))
        .await
        .expect("Failed to create session");
    store
        .update(ClientSession::new("c1", false))
        .await
        .expect("Failed to update session");
    assert!(!store.get("c1").await.expect("session").clean);
    assert!(store.delete("c1").await.is_some());
    assert!(store.get("c1").await.is_none());
}
