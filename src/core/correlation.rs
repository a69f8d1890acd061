use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Lifecycle of one tracked parse request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParseStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ParseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseStatus::Pending => "pending",
            ParseStatus::InProgress => "in_progress",
            ParseStatus::Completed => "completed",
            ParseStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "in_progress" => ParseStatus::InProgress,
            "completed" => ParseStatus::Completed,
            "failed" => ParseStatus::Failed,
            _ => ParseStatus::Pending,
        }
    }
}

/// One row correlating a chat message with its background parse job.
#[derive(Debug, Clone)]
pub struct ParseRecord {
    pub id: i64,
    pub origin_message_id: u64,
    pub response_message_id: u64,
    pub request_id: Option<String>,
    pub status: ParseStatus,
    pub result_url: Option<String>,
    pub record_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

/// SQLite-backed store correlating chat messages, placeholder replies and
/// agent request ids.
///
/// `origin_message_id` is unique: re-delivered messages never create a second
/// row. `request_id` arrives later, once the agent accepts the job.
pub struct CorrelationStore {
    db: Arc<Mutex<Connection>>,
}

impl CorrelationStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS parse_requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                origin_message_id INTEGER NOT NULL UNIQUE,
                response_message_id INTEGER NOT NULL,
                request_id TEXT,
                status TEXT NOT NULL,
                result_url TEXT,
                record_id INTEGER,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_parse_requests_request_id
                ON parse_requests(request_id);
            CREATE INDEX IF NOT EXISTS idx_parse_requests_response_id
                ON parse_requests(response_message_id);",
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Track a new message alongside its placeholder reply. Returns false
    /// when the origin message is already tracked.
    pub async fn create_request(
        &self,
        origin_message_id: u64,
        response_message_id: u64,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "INSERT OR IGNORE INTO parse_requests
             (origin_message_id, response_message_id, status)
             VALUES (?1, ?2, ?3)",
            params![
                origin_message_id as i64,
                response_message_id as i64,
                ParseStatus::Pending.as_str()
            ],
        )?;
        Ok(changed > 0)
    }

    /// Record the agent's request id once the job is accepted, moving the row
    /// from pending to in_progress.
    pub async fn assign_request(&self, origin_message_id: u64, request_id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE parse_requests
             SET request_id = ?1,
                 status = ?2,
                 updated_at = CURRENT_TIMESTAMP
             WHERE origin_message_id = ?3 AND status = ?4",
            params![
                request_id,
                ParseStatus::InProgress.as_str(),
                origin_message_id as i64,
                ParseStatus::Pending.as_str()
            ],
        )?;
        Ok(changed > 0)
    }

    /// Settle a row from its completion callback. Returns the updated row so
    /// the caller can find the chat messages to edit.
    pub async fn complete(
        &self,
        request_id: &str,
        status: ParseStatus,
        result_url: Option<&str>,
    ) -> Result<Option<ParseRecord>> {
        {
            let db = self.db.lock().await;
            let changed = if let Some(result_url) = result_url {
                db.execute(
                    "UPDATE parse_requests
                     SET status = ?1, result_url = ?2, updated_at = CURRENT_TIMESTAMP
                     WHERE request_id = ?3",
                    params![status.as_str(), result_url, request_id],
                )?
            } else {
                db.execute(
                    "UPDATE parse_requests
                     SET status = ?1, updated_at = CURRENT_TIMESTAMP
                     WHERE request_id = ?2",
                    params![status.as_str(), request_id],
                )?
            };
            if changed == 0 {
                return Ok(None);
            }
        }
        self.get_by_request_id(request_id).await
    }

    /// Mark a row failed before any request id was assigned, used when job
    /// submission itself fails.
    pub async fn fail_by_origin(&self, origin_message_id: u64) -> Result<bool> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE parse_requests
             SET status = ?1, updated_at = CURRENT_TIMESTAMP
             WHERE origin_message_id = ?2",
            params![ParseStatus::Failed.as_str(), origin_message_id as i64],
        )?;
        Ok(changed > 0)
    }

    /// Remember which store row the event landed in, for editorial updates.
    pub async fn set_record_id(&self, request_id: &str, record_id: i64) -> Result<bool> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE parse_requests
             SET record_id = ?1, updated_at = CURRENT_TIMESTAMP
             WHERE request_id = ?2",
            params![record_id, request_id],
        )?;
        Ok(changed > 0)
    }

    /// Swap the placeholder reply id for the final reply id so later replies
    /// to the final message still resolve to this row.
    pub async fn update_response_id(&self, request_id: &str, response_message_id: u64) -> Result<bool> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE parse_requests
             SET response_message_id = ?1, updated_at = CURRENT_TIMESTAMP
             WHERE request_id = ?2",
            params![response_message_id as i64, request_id],
        )?;
        Ok(changed > 0)
    }

    pub async fn get_by_request_id(&self, request_id: &str) -> Result<Option<ParseRecord>> {
        self.get_by("request_id = ?1", rusqlite::types::Value::from(request_id.to_string()))
            .await
    }

    pub async fn get_by_origin_id(&self, origin_message_id: u64) -> Result<Option<ParseRecord>> {
        self.get_by(
            "origin_message_id = ?1",
            rusqlite::types::Value::from(origin_message_id as i64),
        )
        .await
    }

    pub async fn get_by_response_id(&self, response_message_id: u64) -> Result<Option<ParseRecord>> {
        self.get_by(
            "response_message_id = ?1",
            rusqlite::types::Value::from(response_message_id as i64),
        )
        .await
    }

    async fn get_by(
        &self,
        predicate: &str,
        arg: rusqlite::types::Value,
    ) -> Result<Option<ParseRecord>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT id, origin_message_id, response_message_id, request_id,
                    status, result_url, record_id, created_at, updated_at
             FROM parse_requests WHERE {}",
            predicate
        );
        let record = db
            .query_row(&sql, params![arg], |row| {
                Ok(ParseRecord {
                    id: row.get(0)?,
                    origin_message_id: row.get::<_, i64>(1)? as u64,
                    response_message_id: row.get::<_, i64>(2)? as u64,
                    request_id: row.get(3)?,
                    status: ParseStatus::parse(&row.get::<_, String>(4)?),
                    result_url: row.get(5)?,
                    record_id: row.get(6)?,
                    created_at: row.get(7)?,
                    updated_at: row.get(8)?,
                })
            })
            .optional()?;
        Ok(record)
    }
}
