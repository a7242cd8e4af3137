//! Integration tests for awareness across sessions.
//!
//! Verifies presence announcement on connect, selection broadcast,
//! immediate purge on disconnect, and distinct-user counting.

use std::sync::Arc;

use quorum_collab::{
    BroadcastGroup, CollabSession, PresenceColor, PresenceUpdate, SessionConfig,
};
use quorum_core::{Identity, UserId};
use uuid::Uuid;

fn session(hub: &Arc<BroadcastGroup>, doc: Uuid, user: &str) -> CollabSession {
    CollabSession::new(
        Identity::new(UserId::from(user)),
        doc,
        hub.clone(),
        SessionConfig::for_testing(),
    )
}

fn settle(sessions: &mut [CollabSession]) {
    for _ in 0..1_000 {
        let handled: usize = sessions.iter_mut().map(|s| s.pump()).sum();
        if handled == 0 {
            return;
        }
    }
    panic!("Sessions did not settle");
}

async fn connected(users: &[&str]) -> Vec<CollabSession> {
    let hub = Arc::new(BroadcastGroup::new(64));
    let doc = Uuid::new_v4();
    let mut sessions: Vec<CollabSession> = users.iter().map(|u| session(&hub, doc, u)).collect();
    for s in sessions.iter_mut() {
        s.connect().await.unwrap();
    }
    settle(&mut sessions);
    sessions
}

// ─── Presence Protocol Tests ─────────────────────────────────────

#[tokio::test]
async fn test_presence_announced_both_ways() {
    let sessions = connected(&["u1", "u2"]).await;

    // The first session learned about the second from its connect
    // broadcast, the second about the first from the state-request reply.
    for s in &sessions {
        assert_eq!(s.presences().len(), 2);
        assert_eq!(s.distinct_users(), 2);
    }
}

#[tokio::test]
async fn test_selection_broadcast() {
    let mut sessions = connected(&["u1", "u2"]).await;
    let b_client = sessions[1].client_id();

    sessions[1].select_word(Some(2)).unwrap();
    settle(&mut sessions);

    let seen = sessions[0]
        .presences()
        .into_iter()
        .find(|p| p.client_id == b_client)
        .unwrap();
    assert_eq!(seen.selected_word_index, Some(2));
    assert_eq!(seen.user.id, UserId::from("u2"));
    assert_eq!(seen.user.color, PresenceColor::from_user(&UserId::from("u2")));

    // Clicking the same word again clears the selection.
    sessions[1].toggle_word_selection(2).unwrap();
    settle(&mut sessions);
    let seen = sessions[0]
        .presences()
        .into_iter()
        .find(|p| p.client_id == b_client)
        .unwrap();
    assert_eq!(seen.selected_word_index, None);
}

#[tokio::test]
async fn test_rename_keeps_selection() {
    let mut sessions = connected(&["u1", "u2"]).await;
    let a_client = sessions[0].client_id();

    sessions[0].select_word(Some(1)).unwrap();
    sessions[0]
        .set_local_awareness(PresenceUpdate::rename("Alice"))
        .unwrap();
    settle(&mut sessions);

    let seen = sessions[1]
        .presences()
        .into_iter()
        .find(|p| p.client_id == a_client)
        .unwrap();
    assert_eq!(seen.user.display_name, "Alice");
    assert_eq!(seen.selected_word_index, Some(1));
}

#[tokio::test]
async fn test_disconnect_purges_presence() {
    let mut sessions = connected(&["u1", "u2", "u3"]).await;
    let mut sub = sessions[0].subscribe_presence();

    sessions[2].disconnect().await;
    settle(&mut sessions);

    assert_eq!(sessions[0].presences().len(), 2);
    assert_eq!(sessions[1].presences().len(), 2);
    assert_eq!(sub.latest().unwrap().len(), 2);

    // The departed session forgets everyone else too.
    assert_eq!(sessions[2].presences().len(), 1);
}

#[tokio::test]
async fn test_dropped_session_purges_presence() {
    let hub = Arc::new(BroadcastGroup::new(64));
    let doc = Uuid::new_v4();
    let mut sessions = vec![session(&hub, doc, "u1"), session(&hub, doc, "u2")];
    for s in sessions.iter_mut() {
        s.connect().await.unwrap();
    }
    settle(&mut sessions);
    assert_eq!(hub.peer_count().await, 2);
    assert_eq!(sessions[0].distinct_users(), 2);

    // No disconnect(): the session just goes away.
    drop(sessions.pop());
    settle(&mut sessions);

    assert_eq!(hub.peer_count().await, 1);
    assert_eq!(sessions[0].presences().len(), 1);
    assert_eq!(sessions[0].distinct_users(), 1);
}

#[tokio::test]
async fn test_distinct_users_across_tabs() {
    let sessions = connected(&["u1", "u1", "u2"]).await;
    let s = &sessions[2];
    assert_eq!(s.presences().len(), 3);
    assert_eq!(s.distinct_users(), 2);
}

#[tokio::test]
async fn test_reconnect_reannounces() {
    let mut sessions = connected(&["u1", "u2"]).await;
    sessions[1].select_word(Some(3)).unwrap();
    sessions[1].disconnect().await;
    settle(&mut sessions);
    assert_eq!(sessions[0].presences().len(), 1);

    sessions[1].connect().await.unwrap();
    settle(&mut sessions);

    let b_client = sessions[1].client_id();
    let seen = sessions[0]
        .presences()
        .into_iter()
        .find(|p| p.client_id == b_client)
        .unwrap();
    assert_eq!(seen.selected_word_index, Some(3));
    assert_eq!(sessions[1].presences().len(), 2);
}
