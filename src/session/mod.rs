//! Bounded in-memory session store.
//!
//! Conversations are kept in a map guarded by a single `RwLock` together
//! with the set of valid session ids and an LRU order list. Removal from the
//! map always removes the id from the valid set and the order list in the
//! same critical section. Reads hand out defensive copies so callers are
//! decoupled from later mutation.
//!
//! Recency is updated only by successful appends; reading a session does not
//! move it in the LRU order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::llm::ChatMessage;

/// Fixed per-message overhead charged by the size estimator, approximating
/// the timestamp and bookkeeping cost.
pub const MESSAGE_OVERHEAD_BYTES: usize = 24;

/// Role of a message sender within a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

/// A single conversation message.
#[derive(Debug, Clone)]
pub struct Message {
    pub role: MessageRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Render as `role [HH:MM:SS UTC]: text`.
    pub fn formatted(&self) -> String {
        format!(
            "{} [{} UTC]: {}",
            self.role.as_str(),
            self.timestamp.format("%H:%M:%S"),
            self.text
        )
    }

    fn estimated_size(&self) -> usize {
        self.text.len() + self.role.as_str().len() + MESSAGE_OVERHEAD_BYTES
    }
}

/// Observability snapshot of one active session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub message_count: usize,
    pub size_bytes: usize,
    pub last_active: String,
}

struct Session {
    messages: Vec<Message>,
    last_active: DateTime<Utc>,
}

impl Session {
    fn size_bytes(&self) -> usize {
        self.messages.iter().map(Message::estimated_size).sum()
    }
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    /// Ids registered via StartSession and not yet removed.
    valid: HashSet<String>,
    /// Materialised sessions, least recently appended first.
    order: VecDeque<String>,
    lifetime_created: u64,
}

/// Concurrency-safe bounded session store with LRU eviction and idle TTL.
pub struct SessionStore {
    inner: RwLock<Inner>,
    idle_timeout: Duration,
    max_sessions: usize,
    max_messages_per_session: usize,
    max_session_size_bytes: usize,
}

impl SessionStore {
    pub fn new(
        idle_timeout: Duration,
        max_sessions: usize,
        max_messages_per_session: usize,
        max_session_size_bytes: usize,
    ) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            idle_timeout,
            max_sessions,
            max_messages_per_session,
            max_session_size_bytes,
        }
    }

    /// Mark a server-minted id as valid. No session is materialised until the
    /// first append.
    pub fn register(&self, session_id: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.valid.insert(session_id.to_string());
        inner.lifetime_created += 1;
    }

    /// Whether the id was registered and has not been evicted or swept.
    pub fn is_valid(&self, session_id: &str) -> bool {
        self.inner.read().unwrap().valid.contains(session_id)
    }

    /// Append a message. The session is created lazily on first append,
    /// evicting the least recently appended sessions while the store is at
    /// capacity. Rejects when the id is not valid or a per-session cap would
    /// be exceeded. On success the session moves to the LRU tail.
    pub fn append(
        &self,
        session_id: &str,
        role: MessageRole,
        text: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();

        if !inner.valid.contains(session_id) {
            return Err(StoreError::InvalidSession);
        }

        let now = Utc::now();

        if !inner.sessions.contains_key(session_id) {
            while inner.sessions.len() >= self.max_sessions {
                Self::evict_oldest(&mut inner);
            }
            inner.sessions.insert(
                session_id.to_string(),
                Session { messages: Vec::new(), last_active: now },
            );
            inner.order.push_back(session_id.to_string());
        }

        {
            let session = inner
                .sessions
                .get_mut(session_id)
                .expect("session materialised above");

            if session.messages.len() >= self.max_messages_per_session {
                return Err(StoreError::MessageLimit { max: self.max_messages_per_session });
            }

            let message = Message { role, text: text.to_string(), timestamp: now };
            if session.size_bytes() + message.estimated_size() > self.max_session_size_bytes {
                return Err(StoreError::SizeLimit { max: self.max_session_size_bytes });
            }

            session.messages.push(message);
            session.last_active = now;
        }

        if let Some(pos) = inner.order.iter().position(|id| id == session_id) {
            inner.order.remove(pos);
        }
        inner.order.push_back(session_id.to_string());

        Ok(())
    }

    /// Defensive copy of a session's messages; empty when unknown.
    pub fn messages(&self, session_id: &str) -> Vec<Message> {
        let inner = self.inner.read().unwrap();
        inner
            .sessions
            .get(session_id)
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    /// Messages rendered as display strings.
    pub fn formatted_messages(&self, session_id: &str) -> Vec<String> {
        self.messages(session_id)
            .iter()
            .map(Message::formatted)
            .collect()
    }

    /// Projection of the conversation in the shape providers consume.
    pub fn llm_history(&self, session_id: &str) -> Vec<ChatMessage> {
        self.messages(session_id)
            .into_iter()
            .map(|m| ChatMessage { role: m.role.as_str().to_string(), text: m.text })
            .collect()
    }

    /// Number of messages currently held for a session; zero when unknown.
    pub fn message_count(&self, session_id: &str) -> usize {
        let inner = self.inner.read().unwrap();
        inner
            .sessions
            .get(session_id)
            .map(|s| s.messages.len())
            .unwrap_or(0)
    }

    /// Number of materialised sessions.
    pub fn count(&self) -> usize {
        self.inner.read().unwrap().sessions.len()
    }

    /// Total sessions registered over the process lifetime.
    pub fn lifetime_created(&self) -> u64 {
        self.inner.read().unwrap().lifetime_created
    }

    /// Snapshot of every active session for observability.
    pub fn sessions_info(&self) -> Vec<SessionInfo> {
        let inner = self.inner.read().unwrap();
        inner
            .sessions
            .iter()
            .map(|(id, session)| SessionInfo {
                id: id.clone(),
                message_count: session.messages.len(),
                size_bytes: session.size_bytes(),
                last_active: session.last_active.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            })
            .collect()
    }

    /// Aggregate estimated memory across all sessions.
    pub fn total_size_bytes(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner.sessions.values().map(Session::size_bytes).sum()
    }

    /// Remove every session idle longer than the configured TTL. Returns the
    /// number of sessions removed.
    pub fn sweep_idle(&self) -> usize {
        let mut inner = self.inner.write().unwrap();
        let now = Utc::now();

        let expired: Vec<String> = inner
            .sessions
            .iter()
            .filter(|(_, session)| {
                now.signed_duration_since(session.last_active)
                    .to_std()
                    .map(|idle| idle > self.idle_timeout)
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            inner.sessions.remove(id);
            inner.valid.remove(id);
            if let Some(pos) = inner.order.iter().position(|o| o == id) {
                inner.order.remove(pos);
            }
        }

        expired.len()
    }

    fn evict_oldest(inner: &mut Inner) {
        let Some(oldest) = inner.order.pop_front() else {
            return;
        };
        inner.sessions.remove(&oldest);
        inner.valid.remove(&oldest);
    }

    #[cfg(test)]
    fn force_last_active(&self, session_id: &str, last_active: DateTime<Utc>) {
        let mut inner = self.inner.write().unwrap();
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.last_active = last_active;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn store() -> SessionStore {
        SessionStore::new(Duration::from_secs(1800), 1000, 100, 100 * 1024)
    }

    #[test]
    fn test_append_requires_registration() {
        let store = store();
        let err = store.append("ghost", MessageRole::User, "hello").unwrap_err();
        assert_eq!(err, StoreError::InvalidSession);
    }

    #[test]
    fn test_append_and_read_back() {
        let store = store();
        store.register("s1");
        store.append("s1", MessageRole::User, "hello").unwrap();
        store.append("s1", MessageRole::Assistant, "hi there").unwrap();

        let messages = store.messages("s1");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].text, "hello");
        assert_eq!(messages[1].role, MessageRole::Assistant);
    }

    #[test]
    fn test_unknown_session_reads_empty() {
        let store = store();
        assert!(store.messages("nope").is_empty());
        assert!(store.formatted_messages("nope").is_empty());
        assert_eq!(store.message_count("nope"), 0);
    }

    #[test]
    fn test_formatted_message_shape() {
        let store = store();
        store.register("s1");
        store.append("s1", MessageRole::User, "hello").unwrap();

        let formatted = store.formatted_messages("s1");
        let re = regex::Regex::new(r"^user \[\d{2}:\d{2}:\d{2} UTC\]: hello$").unwrap();
        assert!(re.is_match(&formatted[0]), "got {:?}", formatted[0]);
    }

    #[test]
    fn test_message_limit_enforced() {
        let store = SessionStore::new(Duration::from_secs(1800), 10, 3, 100 * 1024);
        store.register("s1");
        for i in 0..3 {
            store
                .append("s1", MessageRole::User, &format!("msg {i}"))
                .unwrap();
        }
        let err = store.append("s1", MessageRole::User, "one too many").unwrap_err();
        assert_eq!(err, StoreError::MessageLimit { max: 3 });
        assert_eq!(store.message_count("s1"), 3);
    }

    #[test]
    fn test_size_limit_enforced() {
        // Budget fits exactly one small message and rejects the next.
        let budget = "hello".len() + "user".len() + MESSAGE_OVERHEAD_BYTES + 4;
        let store = SessionStore::new(Duration::from_secs(1800), 10, 100, budget);
        store.register("s1");
        store.append("s1", MessageRole::User, "hello").unwrap();
        let err = store.append("s1", MessageRole::User, "hello").unwrap_err();
        assert_eq!(err, StoreError::SizeLimit { max: budget });
    }

    #[test]
    fn test_lru_eviction_removes_least_recently_appended() {
        let store = SessionStore::new(Duration::from_secs(1800), 2, 100, 100 * 1024);
        for id in ["s1", "s2", "s3"] {
            store.register(id);
        }
        store.append("s1", MessageRole::User, "a").unwrap();
        store.append("s2", MessageRole::User, "b").unwrap();
        // Touch s1 so s2 becomes the eviction candidate.
        store.append("s1", MessageRole::User, "c").unwrap();

        store.append("s3", MessageRole::User, "d").unwrap();

        assert_eq!(store.count(), 2);
        assert!(store.is_valid("s1"));
        assert!(!store.is_valid("s2"), "evicted session must leave the valid set");
        assert!(store.messages("s2").is_empty());
        assert!(store.is_valid("s3"));
    }

    #[test]
    fn test_eviction_then_append_rejects_evicted_id() {
        let store = SessionStore::new(Duration::from_secs(1800), 1, 100, 100 * 1024);
        store.register("s1");
        store.register("s2");
        store.append("s1", MessageRole::User, "a").unwrap();
        store.append("s2", MessageRole::User, "b").unwrap();

        let err = store.append("s1", MessageRole::User, "again").unwrap_err();
        assert_eq!(err, StoreError::InvalidSession);
    }

    #[test]
    fn test_reads_do_not_touch_recency() {
        let store = SessionStore::new(Duration::from_secs(1800), 2, 100, 100 * 1024);
        for id in ["s1", "s2", "s3"] {
            store.register(id);
        }
        store.append("s1", MessageRole::User, "a").unwrap();
        store.append("s2", MessageRole::User, "b").unwrap();
        // Reading s1 must not protect it from eviction.
        let _ = store.messages("s1");
        store.append("s3", MessageRole::User, "c").unwrap();

        assert!(store.messages("s1").is_empty());
        assert!(!store.messages("s2").is_empty());
    }

    #[test]
    fn test_defensive_copy() {
        let store = store();
        store.register("s1");
        store.append("s1", MessageRole::User, "hello").unwrap();

        let before = store.messages("s1");
        store.append("s1", MessageRole::Assistant, "hi").unwrap();
        assert_eq!(before.len(), 1, "earlier copy must not grow");
    }

    #[test]
    fn test_sweep_idle_removes_expired() {
        let store = SessionStore::new(Duration::from_secs(60), 10, 100, 100 * 1024);
        store.register("old");
        store.register("fresh");
        store.append("old", MessageRole::User, "a").unwrap();
        store.append("fresh", MessageRole::User, "b").unwrap();

        store.force_last_active("old", Utc::now() - chrono::Duration::seconds(120));
        let removed = store.sweep_idle();

        assert_eq!(removed, 1);
        assert!(!store.is_valid("old"));
        assert!(store.messages("old").is_empty());
        assert!(store.is_valid("fresh"));
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_sweep_idle_noop_when_active() {
        let store = store();
        store.register("s1");
        store.append("s1", MessageRole::User, "a").unwrap();
        assert_eq!(store.sweep_idle(), 0);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_lifetime_created_counts_registrations() {
        let store = store();
        assert_eq!(store.lifetime_created(), 0);
        store.register("s1");
        store.register("s2");
        assert_eq!(store.lifetime_created(), 2);
        // Eviction does not decrement the lifetime counter.
        store.append("s1", MessageRole::User, "a").unwrap();
        store.sweep_idle();
        assert_eq!(store.lifetime_created(), 2);
    }

    #[test]
    fn test_sessions_info_snapshot() {
        let store = store();
        store.register("s1");
        store.append("s1", MessageRole::User, "hello").unwrap();

        let infos = store.sessions_info();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].id, "s1");
        assert_eq!(infos[0].message_count, 1);
        assert_eq!(
            infos[0].size_bytes,
            "hello".len() + "user".len() + MESSAGE_OVERHEAD_BYTES
        );
        assert!(infos[0].last_active.ends_with('Z'));
    }

    #[test]
    fn test_llm_history_projection() {
        let store = store();
        store.register("s1");
        store.append("s1", MessageRole::User, "hello").unwrap();
        store.append("s1", MessageRole::Assistant, "hi").unwrap();

        let history = store.llm_history("s1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, "user");
        assert_eq!(history[0].text, "hello");
        assert_eq!(history[1].role, "assistant");
    }

    #[test]
    fn test_concurrent_appends_stay_bounded() {
        let store = Arc::new(SessionStore::new(
            Duration::from_secs(1800),
            8,
            1000,
            10 * 1024 * 1024,
        ));
        let mut handles = Vec::new();
        for t in 0..16 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                let id = format!("s{t}");
                store.register(&id);
                for i in 0..50 {
                    // Appends may fail once the session is evicted; the store
                    // must simply never exceed its bound or panic.
                    let _ = store.append(&id, MessageRole::User, &format!("m{i}"));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(store.count() <= 8);
    }
}
