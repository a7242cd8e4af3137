//! Quorum demo: several replicas of one document on an in-process hub.
//!
//! Environment:
//! - `QUORUM_REPLICAS`: number of sessions (default 3)
//! - `QUORUM_TEXT`: sentence to initialize the document with
//! - `QUORUM_IDENTITY`: file holding the first session's user id; created on first run
//! - `RUST_LOG`: log verbosity (`info` shows sync and replay events)

use std::env;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::join_all;
use log::{info, warn};
use quorum_collab::{BroadcastGroup, CollabSession, SessionConfig};
use quorum_core::Identity;
use uuid::Uuid;

const DEFAULT_TEXT: &str = "React is a JavaScript library for building user interfaces";
const HUB_CAPACITY: usize = 256;

struct DemoConfig {
    replicas: usize,
    text: String,
    identity_path: Option<PathBuf>,
}

impl DemoConfig {
    fn from_env() -> Self {
        let replicas = match env::var("QUORUM_REPLICAS") {
            Ok(raw) => raw.parse().unwrap_or_else(|_| {
                warn!("Ignoring invalid QUORUM_REPLICAS={raw:?}");
                3
            }),
            Err(_) => 3,
        };
        Self {
            replicas: replicas.max(1),
            text: env::var("QUORUM_TEXT").unwrap_or_else(|_| DEFAULT_TEXT.to_string()),
            identity_path: env::var_os("QUORUM_IDENTITY").map(PathBuf::from),
        }
    }
}

/// Pump every session until a full round reads nothing.
fn settle(sessions: &mut [CollabSession]) -> usize {
    let mut total = 0;
    loop {
        let handled: usize = sessions.iter_mut().map(|s| s.pump()).sum();
        if handled == 0 {
            return total;
        }
        total += handled;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let config = DemoConfig::from_env();
    info!("Starting quorum demo with {} replicas", config.replicas);

    let hub = Arc::new(BroadcastGroup::new(HUB_CAPACITY));
    let doc_id = Uuid::new_v4();

    let mut sessions = Vec::with_capacity(config.replicas);
    for i in 0..config.replicas {
        let identity = match (&config.identity_path, i) {
            (Some(path), 0) => Identity::load_or_create(path)?,
            _ => Identity::ephemeral(),
        };
        sessions.push(CollabSession::new(
            identity,
            doc_id,
            hub.clone(),
            SessionConfig::default(),
        ));
    }

    // The first replica is alone in the room; the rest sync from it.
    sessions[0].connect().await?;
    sessions[0].mark_synced()?;
    for result in join_all(sessions.iter_mut().skip(1).map(|s| s.connect())).await {
        result?;
    }
    settle(&mut sessions);
    info!(
        "{} of {} replicas synced",
        sessions.iter().filter(|s| s.is_synced()).count(),
        sessions.len()
    );

    // Two replicas race to initialize the same sentence.
    for s in sessions.iter_mut().take(2) {
        s.initialize_text(&config.text)?;
    }
    settle(&mut sessions);

    let snapshot = sessions[0].snapshot();
    let Some(target) = snapshot.words.len().checked_sub(1).map(|last| last.min(3)) else {
        return Err("document has no words".into());
    };
    let word_id = snapshot.words[target].id;

    // Concurrent case variants both survive; a later one is suppressed.
    let first = sessions[0].add_suggestion(word_id, "toolkit")?;
    if sessions.len() > 1 {
        sessions[1].add_suggestion(word_id, "Toolkit")?;
    }
    settle(&mut sessions);
    if let Some(last) = sessions.last_mut() {
        let again = last.add_suggestion(word_id, " TOOLKIT ")?;
        info!("Late \"TOOLKIT\" resolved to existing suggestion {again}");
    }

    for (i, s) in sessions.iter_mut().enumerate() {
        if i > 0 {
            s.toggle_vote(first)?;
        }
        s.select_word(Some(i % snapshot.words.len()))?;
    }
    let frames = settle(&mut sessions);
    info!("Settled after {frames} frames");

    let reference = sessions[0].snapshot();
    for s in &sessions[1..] {
        if !reference.same_content(&s.snapshot()) {
            return Err(format!("replica {} diverged", s.client_id()).into());
        }
    }

    println!("{}", reference.to_json()?);
    if let Some(top) = reference.words[target].top_suggestion() {
        println!(
            "Leading suggestion for {:?}: {:?} ({} votes)",
            reference.words[target].text,
            top.text,
            top.votes()
        );
    }
    for p in sessions[0].presences() {
        println!(
            "{} {} {} selected {:?}",
            p.client_id, p.user.display_name, p.user.color, p.selected_word_index
        );
    }
    println!("Distinct users: {}", sessions[0].distinct_users());

    join_all(sessions.iter_mut().map(|s| s.dispose())).await;
    let stats = hub.stats().await;
    info!(
        "Hub sent {} frames, {} lagged, {} peers left",
        stats.messages_sent, stats.messages_lagged, stats.active_peers
    );
    Ok(())
}
