//! Transactional storage of one chat exchange (user turn + assistant turn).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::context::Identity;
use crate::database::{self, Database};
use crate::error::PersistenceError;
use crate::providers::HistoryItem;

const TITLE_CHARS: usize = 50;

/// One completed exchange ready to be stored.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub identity: Option<Identity>,
    pub conversation_hint: Option<String>,
    pub user_text: String,
    pub assistant_text: String,
    /// Earlier turns supplied by the client, written only when a new
    /// conversation is created.
    pub prior_history: Vec<HistoryItem>,
}

/// What a post-commit hook learns about a stored exchange.
#[derive(Debug, Clone)]
pub struct SavedExchange {
    pub conversation_id: String,
    pub user_id: i64,
    pub created_conversation: bool,
    pub user_message_id: String,
    pub assistant_message_id: String,
}

/// Side effect that runs after an exchange is committed, such as a
/// notification. Never runs for a rolled-back exchange.
#[async_trait]
pub trait PostCommitHook: Send + Sync {
    fn name(&self) -> &str;

    async fn after_commit(&self, saved: &SavedExchange) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ExchangeStore: Send + Sync {
    /// Store the exchange and return the conversation it landed in.
    async fn save_exchange(&self, exchange: Exchange) -> Result<String, PersistenceError>;
}

/// Conversation title from the first user message: first 50 characters,
/// with an ellipsis when cut.
pub fn derive_title(user_text: &str) -> String {
    let trimmed = user_text.trim();
    if trimmed.is_empty() {
        return "New conversation".to_string();
    }
    if trimmed.chars().count() <= TITLE_CHARS {
        return trimmed.to_string();
    }
    let mut title: String = trimmed.chars().take(TITLE_CHARS).collect();
    title.push_str("...");
    title
}

pub struct PersistenceManager {
    db: Arc<Database>,
    hooks: Vec<Arc<dyn PostCommitHook>>,
}

impl PersistenceManager {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            hooks: Vec::new(),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn PostCommitHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// All writes happen on one dedicated connection inside one
    /// transaction; any failure drops the transaction, which rolls back.
    /// The write lock is taken up front so a concurrent writer makes this
    /// wait on the busy handler instead of failing mid-transaction.
    fn write_exchange(
        conn: &mut rusqlite::Connection,
        user_id: i64,
        exchange: &Exchange,
    ) -> Result<SavedExchange, PersistenceError> {
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let existing = match exchange.conversation_hint.as_deref() {
            Some(hint) if !hint.trim().is_empty() => {
                let found = database::find_owned_conversation(&tx, hint.trim(), user_id)?;
                if found.is_none() {
                    tracing::warn!(
                        "Conversation {} not found for user {}; starting a new one",
                        hint,
                        user_id
                    );
                }
                found
            }
            _ => None,
        };

        let (conversation_id, created_conversation) = match existing {
            Some(conversation) => (conversation.id, false),
            None => {
                let id = database::insert_conversation(
                    &tx,
                    user_id,
                    &derive_title(&exchange.user_text),
                    Utc::now(),
                )?;
                for item in &exchange.prior_history {
                    if item.content.trim().is_empty() {
                        continue;
                    }
                    database::insert_message(&tx, &id, &item.content, item.is_user, !item.is_user)?;
                }
                (id, true)
            }
        };

        let user_message_id =
            database::insert_message(&tx, &conversation_id, &exchange.user_text, true, false)?;
        let assistant_message_id = database::insert_message(
            &tx,
            &conversation_id,
            &exchange.assistant_text,
            false,
            true,
        )?;
        database::touch_conversation(&tx, &conversation_id)?;

        tx.commit()?;

        Ok(SavedExchange {
            conversation_id,
            user_id,
            created_conversation,
            user_message_id,
            assistant_message_id,
        })
    }

    /// Re-read the committed rows. Diagnostic only; never fails the save.
    async fn verify(&self, saved: &SavedExchange) {
        let conversation_id = saved.conversation_id.clone();
        let result = self
            .db
            .with_connection(move |conn| {
                let conversation = database::get_conversation(conn, &conversation_id)?;
                let messages = database::count_messages(conn, &conversation_id)?;
                Ok((conversation, messages))
            })
            .await;

        match result {
            Ok((Some(conversation), messages)) => tracing::debug!(
                "Verified conversation {} ('{}'): {} messages",
                conversation.id,
                conversation.title,
                messages
            ),
            Ok((None, _)) => tracing::warn!(
                "Committed conversation {} is missing on re-read",
                saved.conversation_id
            ),
            Err(e) => tracing::warn!(
                "Could not verify conversation {}: {:#}",
                saved.conversation_id,
                e
            ),
        }
    }

    async fn run_hooks(&self, saved: &SavedExchange) {
        for hook in &self.hooks {
            if let Err(e) = hook.after_commit(saved).await {
                tracing::warn!("Post-commit hook {} failed: {:#}", hook.name(), e);
            }
        }
    }
}

#[async_trait]
impl ExchangeStore for PersistenceManager {
    async fn save_exchange(&self, exchange: Exchange) -> Result<String, PersistenceError> {
        let identity = exchange.identity.ok_or(PersistenceError::IdentityRequired)?;
        let user_id = identity.user_id;

        let mut conn = self.db.acquire().await?;
        let saved = tokio::task::spawn_blocking(move || {
            Self::write_exchange(&mut conn, user_id, &exchange)
        })
        .await
        .map_err(|e| PersistenceError::Pool(format!("persistence task failed: {e}")))??;

        tracing::info!(
            "Saved exchange to conversation {} for user {} (new: {})",
            saved.conversation_id,
            saved.user_id,
            saved.created_conversation
        );

        self.verify(&saved).await;
        self.run_hooks(&saved).await;
        Ok(saved.conversation_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::database::test_support::{exec, temp_db, TestDb};

    #[derive(Default)]
    struct RecordingHook {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PostCommitHook for RecordingHook {
        fn name(&self) -> &str {
            "recording"
        }

        async fn after_commit(&self, saved: &SavedExchange) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(saved.conversation_id.clone());
            Ok(())
        }
    }

    fn exchange(user_id: Option<i64>, hint: Option<&str>) -> Exchange {
        Exchange {
            identity: user_id.map(Identity::new),
            conversation_hint: hint.map(str::to_string),
            user_text: "Are there any banking jobs?".to_string(),
            assistant_text: "First Bank is hiring a junior analyst.".to_string(),
            prior_history: Vec::new(),
        }
    }

    async fn counts(test: &TestDb, user_id: i64) -> (usize, usize) {
        test.db
            .with_connection(move |conn| {
                let conversations = database::count_conversations_for_user(conn, user_id)?;
                let messages: i64 =
                    conn.query_row("SELECT COUNT(1) FROM messages", [], |row| row.get(0))?;
                Ok((conversations, messages as usize))
            })
            .await
            .expect("counts")
    }

    #[tokio::test]
    async fn first_exchange_creates_one_conversation_with_two_messages() {
        let test = temp_db(2);
        let manager = PersistenceManager::new(test.db.clone());

        let id = manager
            .save_exchange(exchange(Some(5), None))
            .await
            .expect("save");

        assert_eq!(counts(&test, 5).await, (1, 2));
        let (conversation, messages) = test
            .db
            .with_connection(move |conn| {
                Ok((
                    database::get_conversation(conn, &id)?,
                    database::list_messages(conn, &id)?,
                ))
            })
            .await
            .expect("read back");
        assert_eq!(
            conversation.expect("conversation").title,
            "Are there any banking jobs?"
        );
        assert!(messages[0].is_user_message && !messages[0].is_rich_text);
        assert!(!messages[1].is_user_message && messages[1].is_rich_text);
    }

    #[tokio::test]
    async fn owned_hint_is_reused_and_refreshed() {
        let test = temp_db(2);
        let manager = PersistenceManager::new(test.db.clone());
        let first = manager
            .save_exchange(exchange(Some(5), None))
            .await
            .expect("first save");
        let before = test
            .db
            .with_connection({
                let id = first.clone();
                move |conn| Ok(database::get_conversation(conn, &id)?)
            })
            .await
            .expect("read")
            .expect("conversation");

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = manager
            .save_exchange(exchange(Some(5), Some(&first)))
            .await
            .expect("second save");

        assert_eq!(first, second);
        assert_eq!(counts(&test, 5).await, (1, 4));
        let after = test
            .db
            .with_connection(move |conn| Ok(database::get_conversation(conn, &second)?))
            .await
            .expect("read")
            .expect("conversation");
        assert!(after.updated_at > before.updated_at);
    }

    #[tokio::test]
    async fn foreign_hint_starts_new_conversation_with_backfilled_history() {
        let test = temp_db(2);
        let manager = PersistenceManager::new(test.db.clone());
        let theirs = manager
            .save_exchange(exchange(Some(6), None))
            .await
            .expect("other user");

        let mut mine = exchange(Some(5), Some(&theirs));
        mine.prior_history = vec![
            HistoryItem {
                content: "hello".to_string(),
                is_user: true,
            },
            HistoryItem {
                content: "Hi! How can I help?".to_string(),
                is_user: false,
            },
        ];
        let id = manager.save_exchange(mine).await.expect("save");

        assert_ne!(id, theirs);
        assert_eq!(counts(&test, 5).await.0, 1);
        let messages = test
            .db
            .with_connection(move |conn| Ok(database::list_messages(conn, &id)?))
            .await
            .expect("messages");
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            vec![
                "hello",
                "Hi! How can I help?",
                "Are there any banking jobs?",
                "First Bank is hiring a junior analyst."
            ]
        );
    }

    #[tokio::test]
    async fn failed_assistant_insert_rolls_back_everything_and_skips_hooks() {
        let test = temp_db(2);
        exec(
            &test.db,
            "CREATE TRIGGER reject_assistant BEFORE INSERT ON messages
             WHEN NEW.is_user_message = 0
             BEGIN SELECT RAISE(ABORT, 'boom'); END;",
        )
        .await;
        let hook = Arc::new(RecordingHook::default());
        let manager = PersistenceManager::new(test.db.clone()).with_hook(hook.clone());

        let err = manager
            .save_exchange(exchange(Some(5), None))
            .await
            .expect_err("trigger aborts");

        assert!(matches!(err, PersistenceError::Database(_)), "{err:?}");
        assert_eq!(counts(&test, 5).await, (0, 0));
        assert!(hook.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn hooks_run_after_commit() {
        let test = temp_db(2);
        let hook = Arc::new(RecordingHook::default());
        let manager = PersistenceManager::new(test.db.clone()).with_hook(hook.clone());

        let id = manager
            .save_exchange(exchange(Some(5), None))
            .await
            .expect("save");
        assert_eq!(*hook.seen.lock().unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn anonymous_exchange_is_rejected() {
        let test = temp_db(1);
        let manager = PersistenceManager::new(test.db.clone());
        let err = manager
            .save_exchange(exchange(None, None))
            .await
            .expect_err("anonymous");
        assert!(matches!(err, PersistenceError::IdentityRequired));
    }

    #[tokio::test]
    async fn save_waits_for_concurrent_writer_on_another_connection() {
        let test = temp_db(2);
        let manager = Arc::new(PersistenceManager::new(test.db.clone()));
        let id = manager
            .save_exchange(exchange(Some(5), None))
            .await
            .expect("first save");

        let writer = test.db.acquire().await.expect("writer connection");
        writer.execute_batch("BEGIN IMMEDIATE").expect("begin");
        database::insert_message(&writer, &id, "written elsewhere", true, false)
            .expect("concurrent insert");

        let save = tokio::spawn({
            let manager = manager.clone();
            let hint = id.clone();
            async move {
                manager
                    .save_exchange(exchange(Some(5), Some(&hint)))
                    .await
            }
        });
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        writer.execute_batch("COMMIT").expect("commit");
        drop(writer);

        let saved = save.await.expect("join").expect("save after writer commits");
        assert_eq!(saved, id);
        assert_eq!(counts(&test, 5).await, (1, 5));
    }

    #[test]
    fn titles_are_cut_at_fifty_characters() {
        assert_eq!(derive_title("  Short question  "), "Short question");
        let long = "a".repeat(60);
        assert_eq!(derive_title(&long), format!("{}...", "a".repeat(50)));
        assert_eq!(derive_title("   "), "New conversation");
    }
}
