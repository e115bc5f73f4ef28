//! Per-session conversation history.
//!
//! Each session keeps its last `history_turns` question/answer pairs,
//! serialized as JSON into the `sessions` table of `config.redb`.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::{
    config_db::ConfigDb,
    error::{Error, Result},
    llm::ChatMessage,
};

pub const DEFAULT_SESSION: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub question: String,
    pub answer: String,
}

/// Bounded conversation history, oldest exchange first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct History {
    turns: VecDeque<Exchange>,
    limit: usize,
}

impl History {
    pub fn new(limit: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn turns(&self) -> impl Iterator<Item = &Exchange> {
        self.turns.iter()
    }

    /// Record an exchange, dropping the oldest ones beyond the limit.
    pub fn push(
        &mut self,
        question: impl Into<String>,
        answer: impl Into<String>,
    ) {
        self.turns.push_back(Exchange {
            question: question.into(),
            answer: answer.into(),
        });
        while self.turns.len() > self.limit {
            self.turns.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// The history as alternating user/assistant messages.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.turns
            .iter()
            .flat_map(|t| {
                [
                    ChatMessage::user(t.question.clone()),
                    ChatMessage::assistant(t.answer.clone()),
                ]
            })
            .collect()
    }
}

pub struct SessionStore<'a> {
    db: &'a ConfigDb,
    limit: usize,
}

impl<'a> SessionStore<'a> {
    pub fn new(db: &'a ConfigDb, limit: usize) -> Self {
        Self { db, limit }
    }

    /// Load a session's history; unknown sessions start empty.
    pub fn load(&self, id: &str) -> Result<History> {
        let id = validate_id(id)?;
        let mut history = History::new(self.limit);
        if let Some(bytes) = self.db.get_session(id)? {
            let turns: Vec<Exchange> =
                serde_json::from_slice(&bytes).map_err(|e| {
                    Error::Storage(format!("session {id} is corrupt: {e}"))
                })?;
            for turn in turns {
                history.push(turn.question, turn.answer);
            }
        }
        Ok(history)
    }

    pub fn save(&self, id: &str, history: &History) -> Result<()> {
        let id = validate_id(id)?;
        let turns: Vec<&Exchange> = history.turns().collect();
        self.db.set_session(id, &serde_json::to_vec(&turns)?)?;
        tracing::debug!(session = id, turns = turns.len(), "saved session");
        Ok(())
    }

    /// Forget a session. Returns whether it existed.
    pub fn clear(&self, id: &str) -> Result<bool> {
        self.db.remove_session(validate_id(id)?)
    }

    pub fn list(&self) -> Result<Vec<String>> {
        self.db.list_session_ids()
    }
}

fn validate_id(id: &str) -> Result<&str> {
    let id = id.trim();
    if id.is_empty() {
        return Err(Error::Config("session id must not be empty".into()));
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, ConfigDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = ConfigDb::open(&tmp.path().join("config.db")).unwrap();
        (tmp, db)
    }

    #[test]
    fn history_keeps_only_the_latest_turns() {
        let mut history = History::new(2);
        history.push("q1", "a1");
        history.push("q2", "a2");
        history.push("q3", "a3");

        let questions: Vec<&str> =
            history.turns().map(|t| t.question.as_str()).collect();
        assert_eq!(questions, vec!["q2", "q3"]);
        assert_eq!(history.messages().len(), 4);
        assert_eq!(history.messages()[0], ChatMessage::user("q2"));
    }

    #[test]
    fn zero_limit_keeps_nothing() {
        let mut history = History::new(0);
        history.push("q", "a");
        assert!(history.is_empty());
    }

    #[test]
    fn sessions_persist_and_clear() {
        let (_tmp, db) = test_db();
        let store = SessionStore::new(&db, 10);

        assert!(store.load("exam").unwrap().is_empty());

        let mut history = store.load("exam").unwrap();
        history.push("What is MMR?", "Maximal marginal relevance.");
        store.save("exam", &history).unwrap();

        assert_eq!(store.load("exam").unwrap(), history);
        assert_eq!(store.list().unwrap(), vec!["exam"]);

        assert!(store.clear("exam").unwrap());
        assert!(store.load("exam").unwrap().is_empty());
    }

    #[test]
    fn smaller_limit_truncates_on_load() {
        let (_tmp, db) = test_db();
        let mut history = History::new(5);
        for i in 0..5 {
            history.push(format!("q{i}"), format!("a{i}"));
        }
        SessionStore::new(&db, 5).save("s", &history).unwrap();

        let loaded = SessionStore::new(&db, 2).load("s").unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.turns().next().unwrap().question, "q3");
    }

    #[test]
    fn corrupt_session_is_storage_error() {
        let (_tmp, db) = test_db();
        db.set_session("s", b"{").unwrap();
        assert!(matches!(
            SessionStore::new(&db, 3).load("s"),
            Err(Error::Storage(_))
        ));
    }

    #[test]
    fn blank_session_id_is_rejected() {
        let (_tmp, db) = test_db();
        assert!(matches!(
            SessionStore::new(&db, 3).load("  "),
            Err(Error::Config(_))
        ));
    }
}
