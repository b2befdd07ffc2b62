//! Context Store
//!
//! Ordered, append-only conversation history shared by the user and assistant
//! aggregators. The only non-append operation is the one-time seed that
//! installs the retrieval-backed system message. Appends go through a
//! [`RoleWriter`], and each role hands out exactly one writer.

use parking_lot::RwLock;
use std::sync::Arc;

use parley_core::{ConversationRecord, Error, Message, Result, Role};

#[derive(Debug, Default)]
struct StoreInner {
    messages: Vec<Message>,
    next_seq: u64,
    seeded: bool,
    user_writer_taken: bool,
    assistant_writer_taken: bool,
}

impl StoreInner {
    fn push(&mut self, role: Role, content: String) -> Message {
        let message = Message::new(role, content, self.next_seq);
        self.next_seq += 1;
        self.messages.push(message.clone());
        message
    }
}

/// Shared conversation history for one session
#[derive(Debug, Clone, Default)]
pub struct ContextStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the system message and seed messages.
    ///
    /// Allowed once, before any writer has committed. The system message always
    /// lands at index 0.
    pub fn seed(&self, system: impl Into<String>, seed: &[(Role, String)]) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.seeded {
            return Err(Error::Context("context store already seeded".to_string()));
        }
        if seed.iter().any(|(role, _)| *role == Role::System) {
            return Err(Error::Context(
                "seed messages may not contain a second system message".to_string(),
            ));
        }

        inner.messages.clear();
        inner.next_seq = 0;
        inner.push(Role::System, system.into());
        for (role, content) in seed {
            inner.push(*role, content.clone());
        }
        inner.seeded = true;
        Ok(())
    }

    /// Take the single writer for `role`
    pub fn writer(&self, role: Role) -> Result<RoleWriter> {
        let mut inner = self.inner.write();
        let taken = match role {
            Role::User => &mut inner.user_writer_taken,
            Role::Assistant => &mut inner.assistant_writer_taken,
            Role::System => {
                return Err(Error::Context(
                    "system message is only set through seed".to_string(),
                ))
            }
        };
        if *taken {
            return Err(Error::Context(format!("{} writer already taken", role)));
        }
        *taken = true;
        Ok(RoleWriter {
            role,
            store: self.clone(),
        })
    }

    /// Committed messages in commit order
    pub fn snapshot(&self) -> Arc<[Message]> {
        Arc::from(self.inner.read().messages.as_slice())
    }

    pub fn len(&self) -> usize {
        self.inner.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().messages.is_empty()
    }

    pub fn is_seeded(&self) -> bool {
        self.inner.read().seeded
    }

    pub fn system_message(&self) -> Option<Message> {
        self.inner
            .read()
            .messages
            .first()
            .filter(|m| m.role == Role::System)
            .cloned()
    }

    pub fn last(&self) -> Option<Message> {
        self.inner.read().messages.last().cloned()
    }

    /// Structured record of the conversation so far
    pub fn record(&self, connection_id: &str) -> ConversationRecord {
        ConversationRecord::from_messages(connection_id, &self.inner.read().messages)
    }

    fn append(&self, role: Role, content: String) -> Result<Message> {
        let mut inner = self.inner.write();
        if !inner.seeded {
            return Err(Error::Context(format!(
                "{} message committed before the system message was seeded",
                role
            )));
        }
        Ok(inner.push(role, content))
    }
}

/// Append rights for a single role
#[derive(Debug)]
pub struct RoleWriter {
    role: Role,
    store: ContextStore,
}

impl RoleWriter {
    pub fn role(&self) -> Role {
        self.role
    }

    /// Commit one message. Blank content is refused.
    pub fn commit(&self, content: &str) -> Result<Message> {
        let content = content.trim();
        if content.is_empty() {
            return Err(Error::Context(format!("refusing empty {} message", self.role)));
        }
        self.store.append(self.role, content.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> ContextStore {
        let store = ContextStore::new();
        store
            .seed("kb", &[(Role::User, "I want to create a DPR".to_string())])
            .unwrap();
        store
    }

    #[test]
    fn test_seed_places_system_first() {
        let store = seeded();
        let messages = store.snapshot();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].seq, 0);
        assert_eq!(messages[1].seq, 1);
        assert_eq!(store.system_message().unwrap().content, "kb");
    }

    #[test]
    fn test_seed_only_once() {
        let store = seeded();
        assert!(store.seed("again", &[]).is_err());
    }

    #[test]
    fn test_seed_rejects_second_system() {
        let store = ContextStore::new();
        assert!(store.seed("kb", &[(Role::System, "x".into())]).is_err());
        assert!(!store.is_seeded());
    }

    #[test]
    fn test_single_writer_per_role() {
        let store = seeded();
        let _user = store.writer(Role::User).unwrap();
        assert!(store.writer(Role::User).is_err());
        assert!(store.writer(Role::Assistant).is_ok());
        assert!(store.writer(Role::System).is_err());
    }

    #[test]
    fn test_commit_requires_seed() {
        let store = ContextStore::new();
        let writer = store.writer(Role::User).unwrap();
        assert!(writer.commit("hello").is_err());
    }

    #[test]
    fn test_commit_order_and_sequence() {
        let store = seeded();
        let user = store.writer(Role::User).unwrap();
        let assistant = store.writer(Role::Assistant).unwrap();

        assistant.commit("What is today's date?").unwrap();
        user.commit("  2024-05-01 ").unwrap();

        let messages = store.snapshot();
        let seqs: Vec<u64> = messages.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
        assert_eq!(messages[3].content, "2024-05-01");
        assert_eq!(store.last().unwrap().role, Role::User);
    }

    #[test]
    fn test_blank_commit_refused() {
        let store = seeded();
        let user = store.writer(Role::User).unwrap();
        assert!(user.commit("   ").is_err());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_record() {
        let store = seeded();
        let record = store.record("conn-7");
        assert_eq!(record.connection_id, "conn-7");
        assert_eq!(record.count(Role::User), 1);
    }
}
