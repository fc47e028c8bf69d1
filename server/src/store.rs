//! SQLite-backed store for users, sessions and messages. Queries run on the
//! blocking pool; the connection is shared behind a mutex.

// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;
use thiserror::Error;
use uuid::Uuid;

use atelier_protocol::MessageRecord;
use atelier_protocol::Role;
use atelier_protocol::SessionRecord;
use atelier_protocol::SessionStatus;
use atelier_protocol::Step;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("email already registered")]
    EmailTaken,

    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("store task failed")]
    Join,
}

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id            TEXT PRIMARY KEY,
    email         TEXT UNIQUE NOT NULL,
    password_hash TEXT NOT NULL,
    created_at    TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS sessions (
    id            TEXT PRIMARY KEY,
    user_id       TEXT NOT NULL REFERENCES users(id),
    sandbox_id    TEXT,
    preview_url   TEXT,
    title         TEXT,
    status        TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    last_activity TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS messages (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    role       TEXT NOT NULL,
    content    TEXT NOT NULL,
    steps      TEXT,
    created_at TEXT NOT NULL
);
";

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (and migrate) the database at `path`; `:memory:` opens an
    /// in-memory database, useful for tests.
    pub fn open(path: &str) -> StoreResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            f(&mut conn)
        })
        .await
        .map_err(|_| StoreError::Join)?
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    pub async fn create_user(&self, email: &str, password_hash: &str) -> StoreResult<UserRow> {
        let email = email.to_string();
        let password_hash = password_hash.to_string();
        self.call(move |conn| {
            let user = UserRow {
                id: Uuid::new_v4().to_string(),
                email,
                password_hash,
                created_at: Utc::now(),
            };
            let inserted = conn.execute(
                "INSERT INTO users (id, email, password_hash, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    user.id,
                    user.email,
                    user.password_hash,
                    user.created_at.to_rfc3339()
                ],
            );
            match inserted {
                Ok(_) => Ok(user),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::EmailTaken)
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    pub async fn user_by_email(&self, email: &str) -> StoreResult<Option<UserRow>> {
        let email = email.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT id, email, password_hash, created_at FROM users WHERE email = ?1",
                params![email],
                user_from_row,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    pub async fn user_by_id(&self, id: &str) -> StoreResult<Option<UserRow>> {
        let id = id.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT id, email, password_hash, created_at FROM users WHERE id = ?1",
                params![id],
                user_from_row,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub async fn create_session(&self, user_id: &str) -> StoreResult<SessionRecord> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let now = Utc::now();
            let session = SessionRecord {
                id: Uuid::new_v4().to_string(),
                user_id,
                sandbox_id: None,
                preview_url: None,
                title: None,
                status: SessionStatus::Pending,
                created_at: now,
                last_activity: now,
            };
            conn.execute(
                "INSERT INTO sessions (id, user_id, status, created_at, last_activity)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    session.id,
                    session.user_id,
                    session.status.as_str(),
                    now.to_rfc3339(),
                    now.to_rfc3339()
                ],
            )?;
            Ok(session)
        })
        .await
    }

    pub async fn sessions_for_user(&self, user_id: &str) -> StoreResult<Vec<SessionRecord>> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, sandbox_id, preview_url, title, status, created_at, last_activity
                 FROM sessions WHERE user_id = ?1 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(params![user_id], session_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    /// Owner-scoped lookup: an unowned session is indistinguishable from a
    /// missing one.
    pub async fn session_for_user(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> StoreResult<Option<SessionRecord>> {
        let session_id = session_id.to_string();
        let user_id = user_id.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT id, user_id, sandbox_id, preview_url, title, status, created_at, last_activity
                 FROM sessions WHERE id = ?1 AND user_id = ?2",
                params![session_id, user_id],
                session_from_row,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    pub async fn set_title(&self, session_id: &str, title: &str) -> StoreResult<()> {
        let session_id = session_id.to_string();
        let title = title.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE sessions SET title = ?1 WHERE id = ?2",
                params![title, session_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_status(&self, session_id: &str, status: SessionStatus) -> StoreResult<()> {
        let session_id = session_id.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE sessions SET status = ?1 WHERE id = ?2",
                params![status.as_str(), session_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_ready(&self, session_id: &str) -> StoreResult<()> {
        self.set_status(session_id, SessionStatus::Ready).await
    }

    pub async fn attach_sandbox(
        &self,
        session_id: &str,
        sandbox_id: &str,
        preview_url: Option<&str>,
    ) -> StoreResult<()> {
        let session_id = session_id.to_string();
        let sandbox_id = sandbox_id.to_string();
        let preview_url = preview_url.map(str::to_string);
        self.call(move |conn| {
            conn.execute(
                "UPDATE sessions SET sandbox_id = ?1, preview_url = ?2 WHERE id = ?3",
                params![sandbox_id, preview_url, session_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn terminate_session(&self, session_id: &str) -> StoreResult<()> {
        self.set_status(session_id, SessionStatus::Terminated).await
    }

    // ------------------------------------------------------------------
    // Messages and turns
    // ------------------------------------------------------------------

    /// Accept a user message: flip the session to `busy` and append the
    /// message in one transaction. The transition is conditional on the
    /// session still accepting messages, so of two racing turns at most
    /// one is accepted; returns false for the loser.
    pub async fn begin_turn(&self, session_id: &str, content: &str) -> StoreResult<bool> {
        let session_id = session_id.to_string();
        let content = content.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now().to_rfc3339();
            let updated = tx.execute(
                "UPDATE sessions SET status = ?1, last_activity = ?2
                 WHERE id = ?3 AND status IN ('pending', 'ready')",
                params![SessionStatus::Busy.as_str(), now, session_id],
            )?;
            if updated == 0 {
                return Ok(false);
            }
            tx.execute(
                "INSERT INTO messages (session_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![session_id, Role::User.as_str(), content, now],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    /// Close out a turn in one transaction: persist the assistant message
    /// with its frozen step traces, flip the session back to `ready`, bump
    /// `last_activity`, and record the preview URL if one was captured.
    pub async fn finish_turn(
        &self,
        session_id: &str,
        assistant_content: &str,
        steps: &[Step],
        preview_url: Option<&str>,
    ) -> StoreResult<()> {
        let session_id = session_id.to_string();
        let assistant_content = assistant_content.to_string();
        let steps_json = if steps.is_empty() {
            None
        } else {
            Some(serde_json::to_string(steps)?)
        };
        let preview_url = preview_url.map(str::to_string);
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now().to_rfc3339();
            if !assistant_content.is_empty() || steps_json.is_some() {
                tx.execute(
                    "INSERT INTO messages (session_id, role, content, steps, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        session_id,
                        Role::Assistant.as_str(),
                        assistant_content,
                        steps_json,
                        now
                    ],
                )?;
            }
            tx.execute(
                "UPDATE sessions SET status = ?1, last_activity = ?2,
                 preview_url = COALESCE(?3, preview_url) WHERE id = ?4",
                params![SessionStatus::Ready.as_str(), now, preview_url, session_id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn messages_for_session(&self, session_id: &str) -> StoreResult<Vec<MessageRecord>> {
        let session_id = session_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, role, content, steps, created_at
                 FROM messages WHERE session_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![session_id], message_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        email: row.get(1)?,
        password_hash: row.get(2)?,
        created_at: parse_ts(row.get(3)?),
    })
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let status: String = row.get(5)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        sandbox_id: row.get(2)?,
        preview_url: row.get(3)?,
        title: row.get(4)?,
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Error),
        created_at: parse_ts(row.get(6)?),
        last_activity: parse_ts(row.get(7)?),
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let role: String = row.get(2)?;
    let steps_json: Option<String> = row.get(4)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: Role::parse(&role).unwrap_or(Role::Assistant),
        content: row.get(3)?,
        steps: steps_json.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_ts(row.get(5)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn store() -> Store {
        Store::open(":memory:").unwrap()
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let store = store().await;
        store.create_user("a@x.io", "hash").await.unwrap();
        let err = store.create_user("a@x.io", "hash2").await.unwrap_err();
        assert!(matches!(err, StoreError::EmailTaken));
    }

    #[tokio::test]
    async fn session_ownership_is_scoped() {
        let store = store().await;
        let owner = store.create_user("a@x.io", "h").await.unwrap();
        let other = store.create_user("b@x.io", "h").await.unwrap();
        let session = store.create_session(&owner.id).await.unwrap();

        assert!(
            store
                .session_for_user(&session.id, &owner.id)
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            store
                .session_for_user(&session.id, &other.id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn begin_and_finish_turn_round_trip() {
        let store = store().await;
        let user = store.create_user("a@x.io", "h").await.unwrap();
        let session = store.create_session(&user.id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Pending);

        assert!(store.begin_turn(&session.id, "build me a counter").await.unwrap());
        // A racing second turn loses the conditional transition.
        assert!(!store.begin_turn(&session.id, "me too").await.unwrap());
        let busy = store
            .session_for_user(&session.id, &user.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(busy.status, SessionStatus::Busy);

        let steps = vec![Step::tool("step-1", "Edited App.tsx")];
        store
            .finish_turn(&session.id, "done!", &steps, Some("https://p.example"))
            .await
            .unwrap();

        let ready = store
            .session_for_user(&session.id, &user.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ready.status, SessionStatus::Ready);
        assert_eq!(ready.preview_url.as_deref(), Some("https://p.example"));

        let messages = store.messages_for_session(&session.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].steps.as_ref().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn finish_turn_without_content_keeps_message_log_clean() {
        let store = store().await;
        let user = store.create_user("a@x.io", "h").await.unwrap();
        let session = store.create_session(&user.id).await.unwrap();
        store.finish_turn(&session.id, "", &[], None).await.unwrap();
        assert!(store.messages_for_session(&session.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sessions_list_is_newest_first() {
        let store = store().await;
        let user = store.create_user("a@x.io", "h").await.unwrap();
        let first = store.create_session(&user.id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = store.create_session(&user.id).await.unwrap();

        let sessions = store.sessions_for_user(&user.id).await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, second.id);
        assert_eq!(sessions[1].id, first.id);
    }
}
