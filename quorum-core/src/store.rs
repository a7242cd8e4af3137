//! Convergent document state.
//!
//! The store is a pure function of the set of operations it has applied:
//! it keeps every init batch, every suggestion, and one last-writer-wins
//! register per `(suggestion, user)` pair. Snapshots are derived from that
//! state at read time, so two stores that applied the same operations
//! produce equal snapshots no matter the delivery order.
//!
//! ```text
//!   DocOp ──► apply() ──┬── Visible / Silent ──► history, drain pending
//!                       ├── Duplicate ─────────► ignored
//!                       └── Deferred ──────────► pending (bounded retries)
//! ```
//!
//! ## Initialization races
//!
//! Concurrent inits are all retained. The init with the smallest stamp
//! owns the visible word sequence. A word from a losing init aliases the
//! winner's word at the same index when the texts match, so suggestions
//! made against either copy land on the same visible word. Suggestions on
//! non-matching losing words stay dormant.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::clock::Stamp;
use crate::config::EngineConfig;
use crate::identity::UserId;
use crate::ops::{AddSuggestionOp, DocOp, InitOp, ToggleVoteOp, WordSeed};
use crate::{normalize_text, DocumentSnapshot, Suggestion, SuggestionId, Word, WordId};

/// Outcome of applying one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// State changed in a way a snapshot can show.
    Visible,
    /// State changed but no snapshot can tell (e.g. an older register lost).
    Silent,
    /// Already applied.
    Duplicate,
    /// A referenced word or suggestion is not known yet.
    Deferred,
}

impl Applied {
    fn recorded(self) -> bool {
        matches!(self, Applied::Visible | Applied::Silent)
    }
}

#[derive(Debug, Clone, Copy)]
struct WordHome {
    init: Stamp,
    index: usize,
}

#[derive(Debug, Clone, Copy)]
struct VoteRegister {
    stamp: Stamp,
    present: bool,
}

#[derive(Debug, Clone)]
struct SuggestionRecord {
    id: SuggestionId,
    word_id: WordId,
    text: String,
    author_id: UserId,
    created: Stamp,
    votes: HashMap<UserId, VoteRegister>,
}

impl SuggestionRecord {
    fn voted_by(&self) -> impl Iterator<Item = &UserId> {
        self.votes
            .iter()
            .filter(|(_, r)| r.present)
            .map(|(user, _)| user)
    }
}

#[derive(Debug, Clone)]
struct PendingOp {
    op: DocOp,
    attempts: u32,
}

#[derive(Clone)]
pub struct ReplicatedStore {
    config: EngineConfig,
    inits: BTreeMap<Stamp, Vec<WordSeed>>,
    word_homes: HashMap<WordId, WordHome>,
    suggestions: HashMap<SuggestionId, SuggestionRecord>,
    /// Every recorded op, in local application order.
    history: Vec<DocOp>,
    pending: VecDeque<PendingOp>,
    dropped: u64,
}

impl ReplicatedStore {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            inits: BTreeMap::new(),
            word_homes: HashMap::new(),
            suggestions: HashMap::new(),
            history: Vec::new(),
            pending: VecDeque::new(),
            dropped: 0,
        }
    }

    // ── Applying operations ──────────────────────────────────────

    /// Apply an operation produced by this replica.
    ///
    /// Local ops are validated before they are built, so they never defer.
    pub fn apply_local(&mut self, op: DocOp) -> Applied {
        let outcome = self.apply(&op);
        if outcome.recorded() {
            self.history.push(op);
        }
        outcome
    }

    /// Apply an operation received from a peer.
    ///
    /// Returns `true` if the visible document changed, including changes
    /// from buffered operations this one unblocked.
    pub fn apply_remote(&mut self, op: DocOp) -> bool {
        self.apply_remote_batch(std::iter::once(op))
    }

    /// Apply one delivery of remote operations.
    ///
    /// Buffered ops age once per delivery that records anything, never once
    /// per op, so a dependency arriving later in the same delivery always
    /// unblocks them.
    pub fn apply_remote_batch<I>(&mut self, ops: I) -> bool
    where
        I: IntoIterator<Item = DocOp>,
    {
        let mut visible = false;
        let mut recorded = false;

        for op in ops {
            match self.apply(&op) {
                Applied::Deferred => self.defer(op),
                Applied::Duplicate => {}
                outcome => {
                    visible |= outcome == Applied::Visible;
                    recorded = true;
                    self.history.push(op);
                    visible |= self.drain_pending();
                }
            }
        }

        if recorded {
            self.age_pending();
        }
        visible
    }

    fn apply(&mut self, op: &DocOp) -> Applied {
        match op {
            DocOp::Init(op) => self.apply_init(op),
            DocOp::AddSuggestion(op) => self.apply_add_suggestion(op),
            DocOp::ToggleVote(op) => self.apply_toggle_vote(op),
        }
    }

    fn apply_init(&mut self, op: &InitOp) -> Applied {
        if self.inits.contains_key(&op.stamp) {
            return Applied::Duplicate;
        }

        for (index, seed) in op.words.iter().enumerate() {
            self.word_homes
                .entry(seed.id)
                .or_insert(WordHome { init: op.stamp, index });
        }
        self.inits.insert(op.stamp, op.words.clone());

        if self.winning_init() != Some(op.stamp) {
            log::debug!("Init {} lost the initialization race; keeping it for aliasing", op.stamp);
        }
        Applied::Visible
    }

    fn apply_add_suggestion(&mut self, op: &AddSuggestionOp) -> Applied {
        if self.suggestions.contains_key(&op.suggestion_id) {
            return Applied::Duplicate;
        }
        if !self.word_homes.contains_key(&op.word_id) {
            return Applied::Deferred;
        }

        let mut votes = HashMap::new();
        votes.insert(
            op.author_id.clone(),
            VoteRegister { stamp: op.stamp, present: true },
        );
        self.suggestions.insert(
            op.suggestion_id,
            SuggestionRecord {
                id: op.suggestion_id,
                word_id: op.word_id,
                text: op.text.clone(),
                author_id: op.author_id.clone(),
                created: op.stamp,
                votes,
            },
        );
        Applied::Visible
    }

    fn apply_toggle_vote(&mut self, op: &ToggleVoteOp) -> Applied {
        let Some(record) = self.suggestions.get_mut(&op.suggestion_id) else {
            return Applied::Deferred;
        };

        match record.votes.get(&op.user_id) {
            Some(current) if current.stamp == op.stamp => Applied::Duplicate,
            Some(current) if current.stamp > op.stamp => Applied::Silent,
            current => {
                let was_present = current.map(|r| r.present).unwrap_or(false);
                record.votes.insert(
                    op.user_id.clone(),
                    VoteRegister { stamp: op.stamp, present: op.present },
                );
                if was_present == op.present {
                    Applied::Silent
                } else {
                    Applied::Visible
                }
            }
        }
    }

    // ── Out-of-order buffer ──────────────────────────────────────

    fn defer(&mut self, op: DocOp) {
        if self.pending.len() >= self.config.max_pending_ops {
            if let Some(oldest) = self.pending.pop_front() {
                self.dropped += 1;
                log::warn!(
                    "Pending buffer full ({} ops); dropping {} op {}",
                    self.config.max_pending_ops,
                    oldest.op.kind(),
                    oldest.op.stamp()
                );
            }
        }
        log::debug!("Buffering {} op {} until its dependency arrives", op.kind(), op.stamp());
        self.pending.push_back(PendingOp { op, attempts: 0 });
    }

    /// Retry buffered ops until a pass makes no progress. Does not age them.
    fn drain_pending(&mut self) -> bool {
        let mut visible = false;

        loop {
            if self.pending.is_empty() {
                break;
            }

            let mut progressed = false;
            let mut still_pending = VecDeque::with_capacity(self.pending.len());

            while let Some(entry) = self.pending.pop_front() {
                match self.apply(&entry.op) {
                    Applied::Deferred => still_pending.push_back(entry),
                    Applied::Duplicate => progressed = true,
                    outcome => {
                        log::debug!("Applied buffered {} op {}", entry.op.kind(), entry.op.stamp());
                        visible |= outcome == Applied::Visible;
                        self.history.push(entry.op);
                        progressed = true;
                    }
                }
            }

            self.pending = still_pending;
            if !progressed {
                break;
            }
        }

        visible
    }

    /// Count one failed delivery against every op still buffered and drop
    /// those past the retry window.
    fn age_pending(&mut self) {
        let max_attempts = self.config.max_pending_attempts;
        let mut dropped = 0;

        self.pending.retain_mut(|entry| {
            entry.attempts += 1;
            if entry.attempts <= max_attempts {
                return true;
            }
            dropped += 1;
            log::warn!(
                "Dropping {} op {} after {} deliveries: dependency never arrived",
                entry.op.kind(),
                entry.op.stamp(),
                max_attempts
            );
            false
        });
        self.dropped += dropped;
    }

    // ── Queries ──────────────────────────────────────────────────

    fn winning_init(&self) -> Option<Stamp> {
        self.inits.keys().next().copied()
    }

    /// `true` once any init batch has been applied.
    pub fn is_initialized(&self) -> bool {
        !self.inits.is_empty()
    }

    /// Index of the visible word this id resolves to, if any.
    pub fn visible_index(&self, word_id: &WordId) -> Option<usize> {
        let home = self.word_homes.get(word_id)?;
        let winner = self.winning_init()?;
        if home.init == winner {
            return Some(home.index);
        }

        let own = self.inits.get(&home.init)?.get(home.index)?;
        let visible = self.inits.get(&winner)?.get(home.index)?;
        (own.text == visible.text).then_some(home.index)
    }

    /// Id of the visible word at `index`.
    pub fn visible_word_id(&self, index: usize) -> Option<WordId> {
        let winner = self.winning_init()?;
        self.inits.get(&winner)?.get(index).map(|seed| seed.id)
    }

    /// Earliest suggestion on the visible word at `index` whose normalized
    /// text matches `normalized`.
    pub fn find_duplicate(&self, index: usize, normalized: &str) -> Option<SuggestionId> {
        self.suggestions
            .values()
            .filter(|s| self.visible_index(&s.word_id) == Some(index))
            .filter(|s| normalize_text(&s.text) == normalized)
            .min_by_key(|s| s.created)
            .map(|s| s.id)
    }

    /// Whether `user` currently endorses the suggestion; `None` if unknown.
    pub fn has_vote(&self, suggestion_id: &SuggestionId, user: &UserId) -> Option<bool> {
        let record = self.suggestions.get(suggestion_id)?;
        Some(record.votes.get(user).map(|r| r.present).unwrap_or(false))
    }

    pub fn history(&self) -> &[DocOp] {
        &self.history
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Ops dropped from the pending buffer so far.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// Derive the visible document.
    pub fn build_snapshot(&self, version: u64) -> DocumentSnapshot {
        let Some(winner) = self.winning_init() else {
            return DocumentSnapshot { version, ..DocumentSnapshot::empty() };
        };

        let mut words: Vec<Word> = self
            .inits
            .get(&winner)
            .map(|seeds| {
                seeds
                    .iter()
                    .map(|seed| Word {
                        id: seed.id,
                        text: seed.text.clone(),
                        suggestions: Vec::new(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut records: Vec<&SuggestionRecord> = self.suggestions.values().collect();
        records.sort_by_key(|r| r.created);

        for record in records {
            let Some(index) = self.visible_index(&record.word_id) else {
                continue;
            };
            if let Some(word) = words.get_mut(index) {
                word.suggestions.push(Suggestion {
                    id: record.id,
                    text: record.text.clone(),
                    author_id: record.author_id.clone(),
                    voted_by: record.voted_by().cloned().collect(),
                });
            }
        }

        DocumentSnapshot {
            version,
            initialized: true,
            words,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn replica(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn init(counter: u64, r: u128, texts: &[&str]) -> DocOp {
        DocOp::Init(InitOp {
            stamp: Stamp::new(counter, replica(r)),
            words: texts
                .iter()
                .map(|t| WordSeed { id: WordId::new(), text: t.to_string() })
                .collect(),
        })
    }

    fn word_ids(op: &DocOp) -> Vec<WordId> {
        match op {
            DocOp::Init(init) => init.words.iter().map(|w| w.id).collect(),
            _ => panic!("Expected Init op"),
        }
    }

    fn add(counter: u64, r: u128, word_id: WordId, text: &str, author: &str) -> DocOp {
        DocOp::AddSuggestion(AddSuggestionOp {
            stamp: Stamp::new(counter, replica(r)),
            word_id,
            suggestion_id: SuggestionId::new(),
            text: text.into(),
            author_id: UserId::from(author),
        })
    }

    fn suggestion_id(op: &DocOp) -> SuggestionId {
        match op {
            DocOp::AddSuggestion(add) => add.suggestion_id,
            _ => panic!("Expected AddSuggestion op"),
        }
    }

    fn vote(counter: u64, r: u128, sid: SuggestionId, user: &str, present: bool) -> DocOp {
        DocOp::ToggleVote(ToggleVoteOp {
            stamp: Stamp::new(counter, replica(r)),
            suggestion_id: sid,
            user_id: UserId::from(user),
            present,
        })
    }

    fn store() -> ReplicatedStore {
        ReplicatedStore::new(EngineConfig::for_testing())
    }

    #[test]
    fn test_empty_store_snapshot() {
        let snapshot = store().build_snapshot(0);
        assert!(!snapshot.initialized);
        assert!(snapshot.words.is_empty());
    }

    #[test]
    fn test_init_populates_words() {
        let mut s = store();
        assert!(s.apply_remote(init(1, 1, &["React", "is", "a", "library"])));

        let snapshot = s.build_snapshot(1);
        assert!(snapshot.initialized);
        assert_eq!(snapshot.text(), "React is a library");
    }

    #[test]
    fn test_duplicate_init_delivery_is_idempotent() {
        let mut s = store();
        let op = init(1, 1, &["a", "b"]);
        assert!(s.apply_remote(op.clone()));
        assert!(!s.apply_remote(op));
        assert_eq!(s.build_snapshot(0).words.len(), 2);
        assert_eq!(s.history().len(), 1);
    }

    #[test]
    fn test_init_race_smallest_stamp_wins_in_any_order() {
        let first = init(1, 1, &["one", "two"]);
        let second = init(1, 2, &["one", "two"]);

        let mut a = store();
        a.apply_remote(first.clone());
        a.apply_remote(second.clone());

        let mut b = store();
        b.apply_remote(second);
        b.apply_remote(first.clone());

        let snap_a = a.build_snapshot(0);
        let snap_b = b.build_snapshot(0);
        assert_eq!(snap_a.words.len(), 2);
        assert!(snap_a.same_content(&snap_b));
        assert_eq!(snap_a.words[0].id, word_ids(&first)[0]);
    }

    #[test]
    fn test_suggestion_on_losing_init_is_aliased() {
        let winner = init(1, 1, &["React", "library"]);
        let loser = init(1, 2, &["React", "library"]);
        let loser_word = word_ids(&loser)[1];

        let mut s = store();
        s.apply_remote(loser.clone());
        s.apply_remote(add(2, 2, loser_word, "toolkit", "u2"));
        s.apply_remote(winner.clone());

        let snapshot = s.build_snapshot(0);
        assert_eq!(snapshot.words[1].id, word_ids(&winner)[1]);
        assert_eq!(snapshot.words[1].suggestions.len(), 1);
        assert_eq!(snapshot.words[1].suggestions[0].text, "toolkit");
    }

    #[test]
    fn test_suggestion_on_mismatched_losing_word_is_dormant() {
        let winner = init(1, 1, &["alpha"]);
        let loser = init(2, 2, &["beta"]);
        let loser_word = word_ids(&loser)[0];

        let mut s = store();
        s.apply_remote(winner);
        s.apply_remote(loser);
        s.apply_remote(add(3, 2, loser_word, "gamma", "u2"));

        let snapshot = s.build_snapshot(0);
        assert!(snapshot.words[0].suggestions.is_empty());
        assert_eq!(s.pending_len(), 0);
        assert_eq!(s.visible_index(&loser_word), None);
    }

    #[test]
    fn test_add_suggestion_auto_votes_author() {
        let op = init(1, 1, &["library"]);
        let word = word_ids(&op)[0];
        let mut s = store();
        s.apply_remote(op);
        s.apply_remote(add(2, 1, word, "toolkit", "u1"));

        let snapshot = s.build_snapshot(0);
        let sugg = &snapshot.words[0].suggestions[0];
        assert_eq!(sugg.votes(), 1);
        assert!(sugg.has_vote(&UserId::from("u1")));
    }

    #[test]
    fn test_out_of_order_suggestion_is_buffered_then_applied() {
        let op = init(1, 1, &["library"]);
        let word = word_ids(&op)[0];
        let add_op = add(2, 1, word, "toolkit", "u1");
        let sid = suggestion_id(&add_op);
        let vote_op = vote(3, 2, sid, "u3", true);

        let mut s = store();
        assert!(!s.apply_remote(vote_op));
        assert!(!s.apply_remote(add_op));
        assert_eq!(s.pending_len(), 2);

        assert!(s.apply_remote(op));
        assert_eq!(s.pending_len(), 0);

        let snapshot = s.build_snapshot(0);
        assert_eq!(snapshot.words[0].suggestions[0].votes(), 2);
        assert_eq!(s.history().len(), 3);
    }

    #[test]
    fn test_pending_dropped_after_retry_window() {
        let op = init(1, 1, &["library"]);
        let word = word_ids(&op)[0];
        let orphan = vote(5, 2, SuggestionId::new(), "u9", true);

        let mut s = store();
        s.apply_remote(orphan);
        s.apply_remote(op);
        for i in 0..4 {
            s.apply_remote(add(10 + i, 1, word, &format!("s{i}"), "u1"));
        }

        assert_eq!(s.pending_len(), 0);
        assert_eq!(s.dropped_count(), 1);
    }

    #[test]
    fn test_pending_buffer_capacity_drops_oldest() {
        let mut s = store();
        for _ in 0..9 {
            s.apply_remote(vote(1, 1, SuggestionId::new(), "u1", true));
        }
        assert_eq!(s.pending_len(), 8);
        assert_eq!(s.dropped_count(), 1);
    }

    #[test]
    fn test_vote_registers_last_writer_wins_per_pair() {
        let op = init(1, 1, &["library"]);
        let word = word_ids(&op)[0];
        let add_op = add(2, 1, word, "toolkit", "u1");
        let sid = suggestion_id(&add_op);

        let mut s = store();
        s.apply_remote(op);
        s.apply_remote(add_op);

        // Later unvote arrives first, older vote second: unvote must win.
        assert!(!s.apply_remote(vote(6, 3, sid, "u3", false)));
        assert!(!s.apply_remote(vote(4, 3, sid, "u3", true)));
        assert_eq!(s.has_vote(&sid, &UserId::from("u3")), Some(false));

        // Concurrent votes from different users both survive.
        assert!(s.apply_remote(vote(7, 4, sid, "u4", true)));
        assert!(s.apply_remote(vote(7, 5, sid, "u5", true)));
        let snapshot = s.build_snapshot(0);
        assert_eq!(snapshot.words[0].suggestions[0].votes(), 3);
    }

    #[test]
    fn test_redelivered_toggle_is_idempotent() {
        let op = init(1, 1, &["library"]);
        let word = word_ids(&op)[0];
        let add_op = add(2, 1, word, "toolkit", "u1");
        let sid = suggestion_id(&add_op);

        let mut s = store();
        s.apply_remote(op);
        s.apply_remote(add_op);

        let on = vote(3, 3, sid, "u3", true);
        assert!(s.apply_remote(on.clone()));
        assert!(!s.apply_remote(on.clone()));
        assert!(!s.apply_remote(on));
        assert_eq!(s.build_snapshot(0).words[0].suggestions[0].votes(), 2);
        assert_eq!(s.history().len(), 3);

        // A genuine second toggle still flips the vote.
        assert!(s.apply_remote(vote(4, 3, sid, "u3", false)));
        let snapshot = s.build_snapshot(0);
        assert_eq!(snapshot.words[0].suggestions[0].votes(), 1);
        assert!(!snapshot.words[0].suggestions[0].has_vote(&UserId::from("u3")));
    }

    /// Two racing inits, one suggestion on each copy, and votes that
    /// overwrite one another.
    fn racing_ops() -> (Vec<DocOp>, SuggestionId, SuggestionId) {
        let winner = init(1, 1, &["React", "library"]);
        let loser = init(1, 2, &["React", "library"]);
        let first = add(2, 1, word_ids(&winner)[1], "toolkit", "u1");
        let second = add(2, 2, word_ids(&loser)[1], "Toolkit", "u2");
        let (s1, s2) = (suggestion_id(&first), suggestion_id(&second));

        let ops = vec![
            winner,
            loser,
            first,
            second,
            vote(3, 3, s1, "u3", true),
            vote(4, 2, s1, "u2", true),
            vote(5, 2, s1, "u2", false),
            vote(5, 1, s2, "u1", true),
            vote(6, 1, s1, "u1", false),
        ];
        (ops, s1, s2)
    }

    #[test]
    fn test_any_delivery_order_converges() {
        let (ops, s1, s2) = racing_ops();

        let reversed: Vec<DocOp> = ops.iter().rev().cloned().collect();
        let interleaved: Vec<DocOp> = ops
            .iter()
            .step_by(2)
            .chain(ops.iter().skip(1).step_by(2))
            .cloned()
            .collect();
        let duplicated: Vec<DocOp> = reversed
            .iter()
            .flat_map(|op| [op.clone(), op.clone()])
            .chain(ops.iter().cloned())
            .collect();

        let deliver = |order: &[DocOp], batched: bool| {
            let mut s = ReplicatedStore::new(EngineConfig::default());
            if batched {
                s.apply_remote_batch(order.to_vec());
            } else {
                for op in order {
                    s.apply_remote(op.clone());
                }
            }
            assert_eq!(s.pending_len(), 0);
            assert_eq!(s.history().len(), ops.len());
            s.build_snapshot(0)
        };

        let expected = deliver(&ops[..], false);
        for order in [&ops[..], &reversed[..], &interleaved[..], &duplicated[..]] {
            assert!(expected.same_content(&deliver(order, false)));
            assert!(expected.same_content(&deliver(order, true)));
        }

        let word = &expected.words[1];
        assert_eq!(expected.words.len(), 2);
        assert_eq!(word.suggestions.len(), 2);
        let (_, first) = expected.suggestion(&s1).unwrap();
        let (_, second) = expected.suggestion(&s2).unwrap();
        assert_eq!(first.votes(), 1);
        assert!(first.has_vote(&UserId::from("u3")));
        assert_eq!(second.votes(), 2);
        assert_eq!(second.votes(), second.voted_by.len());
    }

    #[test]
    fn test_find_duplicate_is_case_insensitive() {
        let op = init(1, 1, &["library"]);
        let word = word_ids(&op)[0];
        let add_op = add(2, 1, word, "Toolkit", "u1");
        let sid = suggestion_id(&add_op);

        let mut s = store();
        s.apply_remote(op);
        s.apply_remote(add_op);

        assert_eq!(s.find_duplicate(0, "toolkit"), Some(sid));
        assert_eq!(s.find_duplicate(0, "framework"), None);
    }
}
