//! Conversation context per (user, engine) and the turns exchanged in it.

use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::{CONTEXT_RETENTION_SECS, Database, StoreError, now};

/// The vendor conversation a user is currently in with one engine.
#[derive(Debug, Clone, PartialEq)]
pub struct UserContext {
    /// `"{user_id}_{chat_id}"`, so one user keeps separate threads per chat.
    pub user_id: String,
    pub username: String,
    pub engine: String,
    /// Identifies the delivery that created this context.
    pub request_id: String,
    pub conversation_id: Option<String>,
    pub parent_id: Option<String>,
}

impl UserContext {
    pub fn new(user_id: i64, chat_id: i64, engine: &str, request_id: &str, username: Option<&str>) -> Self {
        Self {
            user_id: format!("{user_id}_{chat_id}"),
            username: username.unwrap_or("anonymous").to_string(),
            engine: engine.to_string(),
            request_id: request_id.to_string(),
            conversation_id: None,
            parent_id: None,
        }
    }

    /// Current conversation id, starting a new one if there is none.
    pub fn ensure_conversation(&mut self) -> &str {
        self.conversation_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
    }
}

/// One request/response exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub request: String,
    pub response: String,
}

impl ConversationTurn {
    pub fn new(request: &str, response: &str) -> Self {
        Self {
            request: request.to_string(),
            response: response.to_string(),
        }
    }
}

impl Database {
    /// Build a context for this delivery, picking up the live conversation
    /// id if one exists. Read failures start a fresh conversation.
    pub fn load_context(
        &self,
        user_id: i64,
        chat_id: i64,
        engine: &str,
        request_id: &str,
        username: Option<&str>,
    ) -> UserContext {
        let mut context = UserContext::new(user_id, chat_id, engine, request_id, username);
        let row: Result<Option<(Option<String>, Option<String>)>, rusqlite::Error> = self
            .conn()
            .query_row(
                "SELECT conversation_id, parent_id FROM user_context
                 WHERE user_id = ?1 AND engine = ?2 AND exp > ?3",
                params![context.user_id, engine, now()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional();
        match row {
            Ok(Some((conversation_id, parent_id))) => {
                context.conversation_id = conversation_id;
                context.parent_id = parent_id;
            }
            Ok(None) => {}
            Err(e) => error!(
                "Cannot read user_context for '{}' engine '{}': {e}",
                context.user_id, engine
            ),
        }
        context
    }

    pub fn save_context(&self, context: &UserContext) -> Result<(), StoreError> {
        self.save_context_at(context, now())
    }

    pub(crate) fn save_context_at(&self, context: &UserContext, at: i64) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO user_context (user_id, engine, conversation_id, parent_id, exp)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id, engine) DO UPDATE SET
                conversation_id = excluded.conversation_id,
                parent_id = excluded.parent_id,
                exp = excluded.exp",
            params![
                context.user_id,
                context.engine,
                context.conversation_id,
                context.parent_id,
                at + CONTEXT_RETENTION_SECS
            ],
        )?;
        Ok(())
    }

    /// Persist the context and, when it belongs to a conversation, the turn.
    pub fn save_conversation(&self, context: &UserContext, turn: &ConversationTurn) -> Result<(), StoreError> {
        self.save_conversation_at(context, turn, now())
    }

    pub(crate) fn save_conversation_at(
        &self,
        context: &UserContext,
        turn: &ConversationTurn,
        at: i64,
    ) -> Result<(), StoreError> {
        self.save_context_at(context, at)?;
        self.save_turn_at(context, turn, at)
    }

    /// Append a turn to `context.conversation_id` without touching the
    /// stored context. No-op outside a conversation.
    pub fn save_turn(&self, context: &UserContext, turn: &ConversationTurn) -> Result<(), StoreError> {
        self.save_turn_at(context, turn, now())
    }

    fn save_turn_at(&self, context: &UserContext, turn: &ConversationTurn, at: i64) -> Result<(), StoreError> {
        let Some(ref conversation_id) = context.conversation_id else {
            return Ok(());
        };
        let json = serde_json::to_string(turn)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO user_conversations
             (conversation_id, request_id, user_id, engine, timestamp, conversation, exp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                conversation_id,
                context.request_id,
                context.user_id,
                context.engine,
                at,
                json,
                at + CONTEXT_RETENTION_SECS
            ],
        )?;
        Ok(())
    }

    /// The last `limit` turns of a conversation, oldest first.
    pub fn read_history(&self, conversation_id: &str, limit: usize) -> Result<Vec<ConversationTurn>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT conversation FROM user_conversations
             WHERE conversation_id = ?1 AND exp > ?2
             ORDER BY timestamp DESC, rowid DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![conversation_id, now(), limit as i64], |row| {
            row.get::<_, String>(0)
        })?;

        let mut turns = Vec::new();
        for raw in rows {
            turns.push(serde_json::from_str(&raw?)?);
        }
        turns.reverse();
        Ok(turns)
    }

    /// Forget the current conversation for this (user, engine).
    pub fn reset_conversation(&self, context: &mut UserContext) -> Result<(), StoreError> {
        self.conn().execute(
            "DELETE FROM user_context WHERE user_id = ?1 AND engine = ?2",
            params![context.user_id, context.engine],
        )?;
        info!("Conversation reset for {} on {}", context.user_id, context.engine);
        context.conversation_id = None;
        context.parent_id = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_contact_has_no_conversation() {
        let db = Database::in_memory().unwrap();
        let context = db.load_context(1, 2, "claude", "r1", None);
        assert_eq!(context.user_id, "1_2");
        assert_eq!(context.username, "anonymous");
        assert!(context.conversation_id.is_none());
    }

    #[test]
    fn test_conversation_survives_across_requests() {
        let db = Database::in_memory().unwrap();
        let mut context = db.load_context(1, 2, "claude", "r1", Some("bob"));
        let id = context.ensure_conversation().to_string();
        db.save_conversation(&context, &ConversationTurn::new("hi", "hello")).unwrap();

        let next = db.load_context(1, 2, "claude", "r2", Some("bob"));
        assert_eq!(next.conversation_id.as_deref(), Some(id.as_str()));

        // other engines and chats stay independent
        assert!(db.load_context(1, 2, "bing", "r3", None).conversation_id.is_none());
        assert!(db.load_context(1, 3, "claude", "r4", None).conversation_id.is_none());
    }

    #[test]
    fn test_history_is_oldest_first_and_limited() {
        let db = Database::in_memory().unwrap();
        let mut context = UserContext::new(1, 1, "chatgpt", "r1", None);
        context.conversation_id = Some("c".to_string());
        for (i, at) in [100, 200, 300].iter().enumerate() {
            context.request_id = format!("r{i}");
            let turn = ConversationTurn::new(&format!("q{i}"), &format!("a{i}"));
            db.save_conversation_at(&context, &turn, now() - 1000 + at).unwrap();
        }

        let history = db.read_history("c", 2).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].request, "q1");
        assert_eq!(history[1].request, "q2");
    }

    #[test]
    fn test_expired_context_is_ignored() {
        let db = Database::in_memory().unwrap();
        let mut context = UserContext::new(1, 1, "bing", "r1", None);
        context.conversation_id = Some("stale".to_string());
        db.save_context_at(&context, now() - CONTEXT_RETENTION_SECS - 1).unwrap();

        assert!(db.load_context(1, 1, "bing", "r2", None).conversation_id.is_none());
    }

    #[test]
    fn test_reset_clears_conversation() {
        let db = Database::in_memory().unwrap();
        let mut context = db.load_context(1, 1, "gemini", "r1", None);
        context.ensure_conversation();
        context.parent_id = Some("p".to_string());
        db.save_context(&context).unwrap();

        db.reset_conversation(&mut context).unwrap();
        assert!(context.conversation_id.is_none());
        assert!(context.parent_id.is_none());
        assert!(db.load_context(1, 1, "gemini", "r2", None).conversation_id.is_none());
    }

    #[test]
    fn test_turn_without_conversation_only_touches_context() {
        let db = Database::in_memory().unwrap();
        let context = UserContext::new(1, 1, "dalle", "r1", None);
        db.save_conversation(&context, &ConversationTurn::new("cat", "url")).unwrap();
        let turns: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM user_conversations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(turns, 0);
    }
}
