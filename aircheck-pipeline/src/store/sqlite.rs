//! SQLite-backed task and knowledge-base store
//!
//! All ids are stored as uuid strings and timestamps as RFC3339 text.
//! Typed payloads (detection results, analyses, embeddings) are stored as
//! JSON text columns and validated on read.
//!
//! Claims rely on a single `UPDATE ... WHERE id = (SELECT ... LIMIT 1)
//! RETURNING *` statement. SQLite serializes writers, so the select and
//! the update are one atomic step and two processes can never claim the
//! same row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tracing::info;
use uuid::Uuid;

use aircheck_common::{Error, Result};

use crate::models::{
    AudioFile, DetectionResult, EmbeddingStatus, FactSource, KbEntry, KbMatch, KbStatus, KbUsage,
    ProcessingStatus, Snippet, SnippetAnalysis, SnippetEmbedding, SourceTier, Stage1Response,
};

use super::{KbStore, TaskStore, cosine_similarity};

/// Shared SQLite store used by every stage worker.
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Open (creating if necessary) the database at `db_path` and ensure
    /// the schema exists.
    pub async fn connect(db_path: &Path) -> Result<Self> {
        let newly_created = !db_path.exists();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect(&db_url)
            .await?;

        if newly_created {
            info!("Initialized new database: {}", db_path.display());
        } else {
            info!("Opened existing database: {}", db_path.display());
        }

        // WAL keeps readers unblocked while one writer holds the lock,
        // which is the normal state with several stage processes polling.
        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

        create_audio_files_table(&pool).await?;
        create_stage1_responses_table(&pool).await?;
        create_snippets_table(&pool).await?;
        create_snippet_embeddings_table(&pool).await?;
        create_kb_entries_table(&pool).await?;
        create_kb_sources_table(&pool).await?;
        create_kb_embeddings_table(&pool).await?;
        create_kb_usage_table(&pool).await?;

        Ok(Self { pool })
    }

    /// Open an in-memory database. Test-only convenience.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            // One connection: each :memory: connection is its own database.
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        create_audio_files_table(&pool).await?;
        create_stage1_responses_table(&pool).await?;
        create_snippets_table(&pool).await?;
        create_snippet_embeddings_table(&pool).await?;
        create_kb_entries_table(&pool).await?;
        create_kb_sources_table(&pool).await?;
        create_kb_embeddings_table(&pool).await?;
        create_kb_usage_table(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert an audio file row. Used by ingestion and by tests.
    pub async fn insert_audio_file(&self, file: &AudioFile) -> Result<()> {
        sqlx::query(
            "INSERT INTO audio_files \
             (id, file_path, station_code, station_name, location_state, location_city, \
              recorded_at, status, error_message) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(file.id.to_string())
        .bind(&file.file_path)
        .bind(&file.station_code)
        .bind(&file.station_name)
        .bind(&file.location_state)
        .bind(&file.location_city)
        .bind(file.recorded_at.to_rfc3339())
        .bind(file.status.as_str())
        .bind(&file.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stage-1 responses for one audio file, newest first.
    pub async fn stage1_responses_for(&self, audio_file_id: Uuid) -> Result<Vec<Stage1Response>> {
        let rows = sqlx::query(
            "SELECT * FROM stage1_responses WHERE audio_file_id = ? ORDER BY rowid DESC",
        )
        .bind(audio_file_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(stage1_from_row).collect()
    }

    /// Snippets produced from one stage-1 response.
    pub async fn snippets_for_stage1(&self, stage1_response_id: Uuid) -> Result<Vec<Snippet>> {
        let rows = sqlx::query(
            "SELECT * FROM snippets WHERE stage1_response_id = ? ORDER BY start_time ASC",
        )
        .bind(stage1_response_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(snippet_from_row).collect()
    }

    pub async fn get_snippet_embedding(&self, snippet_id: Uuid) -> Result<Option<SnippetEmbedding>> {
        let row = sqlx::query("SELECT * FROM snippet_embeddings WHERE snippet_id = ?")
            .bind(snippet_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(embedding_from_row).transpose()
    }
}

// ---- schema ----

async fn create_audio_files_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS audio_files (
            id TEXT PRIMARY KEY,
            file_path TEXT NOT NULL,
            station_code TEXT NOT NULL,
            station_name TEXT NOT NULL,
            location_state TEXT NOT NULL,
            location_city TEXT,
            recorded_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'New',
            error_message TEXT
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_audio_files_status \
         ON audio_files(status, recorded_at)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_stage1_responses_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS stage1_responses (
            id TEXT PRIMARY KEY,
            audio_file_id TEXT NOT NULL REFERENCES audio_files(id),
            timestamped_transcription TEXT,
            transcribed_by TEXT,
            initial_detection_result TEXT,
            detection_result TEXT,
            status TEXT NOT NULL DEFAULT 'New',
            error_message TEXT
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_stage1_responses_status \
         ON stage1_responses(status)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_snippets_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS snippets (
            id TEXT PRIMARY KEY,
            audio_file_id TEXT NOT NULL REFERENCES audio_files(id),
            stage1_response_id TEXT NOT NULL REFERENCES stage1_responses(id),
            file_path TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            duration TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'New',
            error_message TEXT,
            analysis TEXT,
            analyzed_by TEXT,
            reviewed_by TEXT,
            previous_analysis TEXT
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_snippets_status \
         ON snippets(status, recorded_at)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_snippet_embeddings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS snippet_embeddings (
            snippet_id TEXT PRIMARY KEY REFERENCES snippets(id),
            document TEXT NOT NULL,
            embedding TEXT NOT NULL,
            model_name TEXT NOT NULL,
            status TEXT NOT NULL,
            error_message TEXT
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_kb_entries_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS kb_entries (
            id TEXT PRIMARY KEY,
            fact TEXT NOT NULL,
            confidence_score INTEGER NOT NULL,
            categories TEXT NOT NULL,
            keywords TEXT NOT NULL,
            related_claim TEXT,
            is_time_sensitive INTEGER NOT NULL DEFAULT 0,
            valid_from TEXT,
            valid_until TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            deactivation_reason TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            previous_version TEXT,
            superseded_by TEXT,
            created_by_snippet TEXT,
            created_by_model TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_kb_entries_status ON kb_entries(status)")
        .execute(pool)
        .await?;
    Ok(())
}

async fn create_kb_sources_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS kb_sources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_id TEXT NOT NULL REFERENCES kb_entries(id),
            url TEXT NOT NULL,
            name TEXT NOT NULL,
            tier TEXT NOT NULL,
            title TEXT,
            excerpt TEXT
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_kb_sources_entry ON kb_sources(entry_id)")
        .execute(pool)
        .await?;
    Ok(())
}

async fn create_kb_embeddings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS kb_embeddings (
            entry_id TEXT PRIMARY KEY REFERENCES kb_entries(id),
            document TEXT NOT NULL,
            embedding TEXT NOT NULL,
            model_name TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_kb_usage_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS kb_usage (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_id TEXT NOT NULL REFERENCES kb_entries(id),
            snippet_id TEXT NOT NULL,
            usage TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

// ---- column helpers ----

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::Data(format!("invalid uuid '{s}': {e}")))
}

fn parse_uuid_opt(s: Option<String>) -> Result<Option<Uuid>> {
    s.as_deref().map(parse_uuid).transpose()
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Data(format!("invalid timestamp '{s}': {e}")))
}

fn parse_timestamp_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_timestamp).transpose()
}

fn parse_status(s: &str) -> Result<ProcessingStatus> {
    ProcessingStatus::parse(s).ok_or_else(|| Error::Data(format!("unknown status '{s}'")))
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::Data(format!("serialize failed: {e}")))
}

fn from_json<T: DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_str(s).map_err(|e| Error::Data(format!("stored JSON invalid: {e}")))
}

fn from_json_opt<T: DeserializeOwned>(s: Option<String>) -> Result<Option<T>> {
    s.as_deref().map(from_json).transpose()
}

// ---- row mapping ----

fn audio_file_from_row(row: &SqliteRow) -> Result<AudioFile> {
    Ok(AudioFile {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        file_path: row.try_get("file_path")?,
        station_code: row.try_get("station_code")?,
        station_name: row.try_get("station_name")?,
        location_state: row.try_get("location_state")?,
        location_city: row.try_get("location_city")?,
        recorded_at: parse_timestamp(&row.try_get::<String, _>("recorded_at")?)?,
        status: parse_status(&row.try_get::<String, _>("status")?)?,
        error_message: row.try_get("error_message")?,
    })
}

fn stage1_from_row(row: &SqliteRow) -> Result<Stage1Response> {
    Ok(Stage1Response {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        audio_file_id: parse_uuid(&row.try_get::<String, _>("audio_file_id")?)?,
        timestamped_transcription: row.try_get("timestamped_transcription")?,
        transcribed_by: row.try_get("transcribed_by")?,
        initial_detection_result: from_json_opt(row.try_get("initial_detection_result")?)?,
        detection_result: from_json_opt(row.try_get("detection_result")?)?,
        status: parse_status(&row.try_get::<String, _>("status")?)?,
        error_message: row.try_get("error_message")?,
    })
}

fn snippet_from_row(row: &SqliteRow) -> Result<Snippet> {
    Ok(Snippet {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        audio_file_id: parse_uuid(&row.try_get::<String, _>("audio_file_id")?)?,
        stage1_response_id: parse_uuid(&row.try_get::<String, _>("stage1_response_id")?)?,
        file_path: row.try_get("file_path")?,
        recorded_at: parse_timestamp(&row.try_get::<String, _>("recorded_at")?)?,
        duration: row.try_get("duration")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        status: parse_status(&row.try_get::<String, _>("status")?)?,
        error_message: row.try_get("error_message")?,
        analysis: from_json_opt(row.try_get("analysis")?)?,
        analyzed_by: row.try_get("analyzed_by")?,
        reviewed_by: row.try_get("reviewed_by")?,
        previous_analysis: from_json_opt(row.try_get("previous_analysis")?)?,
    })
}

fn embedding_from_row(row: &SqliteRow) -> Result<SnippetEmbedding> {
    let status: String = row.try_get("status")?;
    Ok(SnippetEmbedding {
        snippet_id: parse_uuid(&row.try_get::<String, _>("snippet_id")?)?,
        document: row.try_get("document")?,
        embedding: from_json(&row.try_get::<String, _>("embedding")?)?,
        model_name: row.try_get("model_name")?,
        status: EmbeddingStatus::parse(&status)
            .ok_or_else(|| Error::Data(format!("unknown embedding status '{status}'")))?,
        error_message: row.try_get("error_message")?,
    })
}

fn kb_entry_from_row(row: &SqliteRow) -> Result<KbEntry> {
    let status: String = row.try_get("status")?;
    Ok(KbEntry {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        fact: row.try_get("fact")?,
        confidence_score: row.try_get::<i64, _>("confidence_score")? as u8,
        categories: from_json(&row.try_get::<String, _>("categories")?)?,
        keywords: from_json(&row.try_get::<String, _>("keywords")?)?,
        related_claim: row.try_get("related_claim")?,
        is_time_sensitive: row.try_get::<i64, _>("is_time_sensitive")? != 0,
        valid_from: parse_timestamp_opt(row.try_get("valid_from")?)?,
        valid_until: parse_timestamp_opt(row.try_get("valid_until")?)?,
        status: KbStatus::parse(&status)
            .ok_or_else(|| Error::Data(format!("unknown kb status '{status}'")))?,
        deactivation_reason: row.try_get("deactivation_reason")?,
        version: row.try_get::<i64, _>("version")? as u32,
        previous_version: parse_uuid_opt(row.try_get("previous_version")?)?,
        superseded_by: parse_uuid_opt(row.try_get("superseded_by")?)?,
        created_by_snippet: parse_uuid_opt(row.try_get("created_by_snippet")?)?,
        created_by_model: row.try_get("created_by_model")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn kb_source_from_row(row: &SqliteRow) -> Result<FactSource> {
    let tier: String = row.try_get("tier")?;
    Ok(FactSource {
        url: row.try_get("url")?,
        name: row.try_get("name")?,
        tier: SourceTier::parse(&tier)
            .ok_or_else(|| Error::Data(format!("unknown source tier '{tier}'")))?,
        title: row.try_get("title")?,
        excerpt: row.try_get("excerpt")?,
    })
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn claim_next_audio_file(&self) -> Result<Option<AudioFile>> {
        let row = sqlx::query(
            "UPDATE audio_files SET status = 'Processing', error_message = NULL \
             WHERE id = (SELECT id FROM audio_files WHERE status = 'New' \
                         ORDER BY recorded_at ASC, id ASC LIMIT 1) \
             RETURNING *",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(audio_file_from_row).transpose()
    }

    async fn claim_next_stage1_response(&self) -> Result<Option<Stage1Response>> {
        let row = sqlx::query(
            "UPDATE stage1_responses SET status = 'Processing', error_message = NULL \
             WHERE id = (SELECT id FROM stage1_responses WHERE status = 'New' \
                         ORDER BY rowid ASC LIMIT 1) \
             RETURNING *",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(stage1_from_row).transpose()
    }

    async fn claim_next_snippet(&self) -> Result<Option<Snippet>> {
        let row = sqlx::query(
            "UPDATE snippets SET status = 'Processing', error_message = NULL \
             WHERE id = (SELECT id FROM snippets WHERE status = 'New' \
                         ORDER BY recorded_at ASC, id ASC LIMIT 1) \
             RETURNING *",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(snippet_from_row).transpose()
    }

    async fn claim_next_reviewable_snippet(&self) -> Result<Option<Snippet>> {
        let row = sqlx::query(
            "UPDATE snippets SET status = 'Reviewing', error_message = NULL \
             WHERE id = (SELECT id FROM snippets WHERE status = 'Ready for review' \
                         ORDER BY recorded_at ASC, id ASC LIMIT 1) \
             RETURNING *",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(snippet_from_row).transpose()
    }

    async fn claim_next_unembedded_snippet(&self) -> Result<Option<Snippet>> {
        let row = sqlx::query(
            "SELECT s.* FROM snippets s \
             LEFT JOIN snippet_embeddings e ON e.snippet_id = s.id \
             WHERE s.status = 'Processed' AND e.snippet_id IS NULL \
             ORDER BY s.recorded_at ASC, s.id ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(snippet_from_row).transpose()
    }

    async fn get_audio_file(&self, id: Uuid) -> Result<Option<AudioFile>> {
        let row = sqlx::query("SELECT * FROM audio_files WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(audio_file_from_row).transpose()
    }

    async fn get_stage1_response(&self, id: Uuid) -> Result<Option<Stage1Response>> {
        let row = sqlx::query("SELECT * FROM stage1_responses WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(stage1_from_row).transpose()
    }

    async fn get_snippet(&self, id: Uuid) -> Result<Option<Snippet>> {
        let row = sqlx::query("SELECT * FROM snippets WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(snippet_from_row).transpose()
    }

    async fn set_audio_file_status(
        &self,
        id: Uuid,
        status: ProcessingStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE audio_files SET status = ?, error_message = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(error_message)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_stage1_response_status(
        &self,
        id: Uuid,
        status: ProcessingStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE stage1_responses SET status = ?, error_message = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(error_message)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_snippet_status(
        &self,
        id: Uuid,
        status: ProcessingStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE snippets SET status = ?, error_message = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(error_message)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_stage1_response(&self, response: &Stage1Response) -> Result<()> {
        let initial = response
            .initial_detection_result
            .as_ref()
            .map(to_json)
            .transpose()?;
        let detection = response.detection_result.as_ref().map(to_json).transpose()?;
        sqlx::query(
            "INSERT INTO stage1_responses \
             (id, audio_file_id, timestamped_transcription, transcribed_by, \
              initial_detection_result, detection_result, status, error_message) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(response.id.to_string())
        .bind(response.audio_file_id.to_string())
        .bind(&response.timestamped_transcription)
        .bind(&response.transcribed_by)
        .bind(initial)
        .bind(detection)
        .bind(response.status.as_str())
        .bind(&response.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_snippet(&self, snippet: &Snippet) -> Result<bool> {
        let analysis = snippet.analysis.as_ref().map(to_json).transpose()?;
        let previous = snippet.previous_analysis.as_ref().map(to_json).transpose()?;
        let result = sqlx::query(
            "INSERT OR IGNORE INTO snippets \
             (id, audio_file_id, stage1_response_id, file_path, recorded_at, duration, \
              start_time, end_time, status, error_message, analysis, analyzed_by, \
              reviewed_by, previous_analysis) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(snippet.id.to_string())
        .bind(snippet.audio_file_id.to_string())
        .bind(snippet.stage1_response_id.to_string())
        .bind(&snippet.file_path)
        .bind(snippet.recorded_at.to_rfc3339())
        .bind(&snippet.duration)
        .bind(&snippet.start_time)
        .bind(&snippet.end_time)
        .bind(snippet.status.as_str())
        .bind(&snippet.error_message)
        .bind(analysis)
        .bind(&snippet.analyzed_by)
        .bind(&snippet.reviewed_by)
        .bind(previous)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_stage1_detection(&self, id: Uuid, result: &DetectionResult) -> Result<()> {
        let json = to_json(result)?;
        // The first detection result is also kept as the immutable
        // initial copy; redo overwrites only the current one.
        sqlx::query(
            "UPDATE stage1_responses SET \
             detection_result = ?, \
             initial_detection_result = COALESCE(initial_detection_result, ?) \
             WHERE id = ?",
        )
        .bind(&json)
        .bind(&json)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_stage1_transcription(
        &self,
        id: Uuid,
        transcription: &str,
        transcribed_by: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE stage1_responses SET timestamped_transcription = ?, transcribed_by = ? \
             WHERE id = ?",
        )
        .bind(transcription)
        .bind(transcribed_by)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_snippet_analysis(
        &self,
        id: Uuid,
        analysis: &SnippetAnalysis,
        analyzed_by: &str,
        status: ProcessingStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE snippets SET analysis = ?, analyzed_by = ?, status = ?, \
             error_message = NULL WHERE id = ?",
        )
        .bind(to_json(analysis)?)
        .bind(analyzed_by)
        .bind(status.as_str())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn backup_snippet_analysis(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE snippets SET previous_analysis = analysis \
             WHERE id = ? AND previous_analysis IS NULL AND analysis IS NOT NULL",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn submit_snippet_review(
        &self,
        id: Uuid,
        analysis: &SnippetAnalysis,
        reviewed_by: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE snippets SET analysis = ?, reviewed_by = ?, status = 'Processed', \
             error_message = NULL WHERE id = ?",
        )
        .bind(to_json(analysis)?)
        .bind(reviewed_by)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_audio_files(&self, ids: &[Uuid]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut count = 0u64;
        for id in ids {
            let result =
                sqlx::query("UPDATE audio_files SET status = 'New', error_message = NULL WHERE id = ?")
                    .bind(id.to_string())
                    .execute(&mut *tx)
                    .await?;
            count += result.rows_affected();
        }
        tx.commit().await?;
        Ok(count)
    }

    async fn delete_stage1_responses_for(&self, audio_file_ids: &[Uuid]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut count = 0u64;
        for id in audio_file_ids {
            let result = sqlx::query("DELETE FROM stage1_responses WHERE audio_file_id = ?")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
            count += result.rows_affected();
        }
        tx.commit().await?;
        Ok(count)
    }

    async fn reset_stage1_response(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE stage1_responses SET status = 'New', error_message = NULL WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_snippet(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM snippet_embeddings WHERE snippet_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM snippets WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn reset_snippets(&self, ids: &[Uuid]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut count = 0u64;
        for id in ids {
            let result = sqlx::query(
                "UPDATE snippets SET status = 'New', error_message = NULL, analysis = NULL, \
                 analyzed_by = NULL, reviewed_by = NULL, previous_analysis = NULL WHERE id = ?",
            )
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
            count += result.rows_affected();
        }
        tx.commit().await?;
        Ok(count)
    }

    async fn upsert_snippet_embedding(&self, embedding: &SnippetEmbedding) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO snippet_embeddings \
             (snippet_id, document, embedding, model_name, status, error_message) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(embedding.snippet_id.to_string())
        .bind(&embedding.document)
        .bind(to_json(&embedding.embedding)?)
        .bind(&embedding.model_name)
        .bind(embedding.status.as_str())
        .bind(&embedding.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_snippet_embedding(&self, snippet_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM snippet_embeddings WHERE snippet_id = ?")
            .bind(snippet_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl KbStore for SqliteTaskStore {
    async fn insert_entry(
        &self,
        entry: &KbEntry,
        sources: &[FactSource],
        document: &str,
        embedding: &[f32],
        embedding_model: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO kb_entries \
             (id, fact, confidence_score, categories, keywords, related_claim, \
              is_time_sensitive, valid_from, valid_until, status, deactivation_reason, \
              version, previous_version, superseded_by, created_by_snippet, \
              created_by_model, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.id.to_string())
        .bind(&entry.fact)
        .bind(entry.confidence_score as i64)
        .bind(to_json(&entry.categories)?)
        .bind(to_json(&entry.keywords)?)
        .bind(&entry.related_claim)
        .bind(entry.is_time_sensitive as i64)
        .bind(entry.valid_from.map(|t| t.to_rfc3339()))
        .bind(entry.valid_until.map(|t| t.to_rfc3339()))
        .bind(entry.status.as_str())
        .bind(&entry.deactivation_reason)
        .bind(entry.version as i64)
        .bind(entry.previous_version.map(|u| u.to_string()))
        .bind(entry.superseded_by.map(|u| u.to_string()))
        .bind(entry.created_by_snippet.map(|u| u.to_string()))
        .bind(&entry.created_by_model)
        .bind(entry.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        for source in sources {
            sqlx::query(
                "INSERT INTO kb_sources (entry_id, url, name, tier, title, excerpt) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(entry.id.to_string())
            .bind(&source.url)
            .bind(&source.name)
            .bind(source.tier.as_str())
            .bind(&source.title)
            .bind(&source.excerpt)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO kb_embeddings (entry_id, document, embedding, model_name) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(entry.id.to_string())
        .bind(document)
        .bind(to_json(&embedding)?)
        .bind(embedding_model)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_entry(&self, id: Uuid) -> Result<Option<KbEntry>> {
        let row = sqlx::query("SELECT * FROM kb_entries WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(kb_entry_from_row).transpose()
    }

    async fn entry_sources(&self, id: Uuid) -> Result<Vec<FactSource>> {
        let rows = sqlx::query("SELECT * FROM kb_sources WHERE entry_id = ? ORDER BY id ASC")
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(kb_source_from_row).collect()
    }

    async fn search_active(
        &self,
        embedding: &[f32],
        threshold: f32,
        limit: usize,
        categories: Option<&[String]>,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<KbMatch>> {
        // The active set stays small enough (thousands of entries) that a
        // full scan with in-process cosine scoring is the simplest thing
        // that works on SQLite.
        let rows = sqlx::query(
            "SELECT en.*, em.embedding AS stored_embedding FROM kb_entries en \
             JOIN kb_embeddings em ON em.entry_id = en.id \
             WHERE en.status = 'active'",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut matches = Vec::new();
        for row in &rows {
            let entry = kb_entry_from_row(row)?;
            if let Some(wanted) = categories {
                if !wanted.is_empty() && !entry.categories.iter().any(|c| wanted.contains(c)) {
                    continue;
                }
            }
            if let Some(at) = as_of {
                if entry.is_time_sensitive {
                    if let Some(from) = entry.valid_from {
                        if at < from {
                            continue;
                        }
                    }
                    if let Some(until) = entry.valid_until {
                        if at > until {
                            continue;
                        }
                    }
                }
            }
            let stored: Vec<f32> = from_json(&row.try_get::<String, _>("stored_embedding")?)?;
            let similarity = cosine_similarity(embedding, &stored);
            if similarity >= threshold {
                matches.push(KbMatch {
                    entry,
                    sources: Vec::new(),
                    similarity,
                });
            }
        }

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(limit);

        for hit in &mut matches {
            hit.sources = self.entry_sources(hit.entry.id).await?;
        }
        Ok(matches)
    }

    async fn mark_superseded(&self, old_id: Uuid, new_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE kb_entries SET status = 'superseded', superseded_by = ? WHERE id = ?",
        )
        .bind(new_id.to_string())
        .bind(old_id.to_string())
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM kb_embeddings WHERE entry_id = ?")
            .bind(old_id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn deactivate_entry(&self, id: Uuid, reason: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE kb_entries SET status = 'deactivated', deactivation_reason = ? WHERE id = ?",
        )
        .bind(reason)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM kb_embeddings WHERE entry_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_usage(&self, entry_id: Uuid, snippet_id: Uuid, usage: KbUsage) -> Result<()> {
        sqlx::query(
            "INSERT INTO kb_usage (entry_id, snippet_id, usage, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(entry_id.to_string())
        .bind(snippet_id.to_string())
        .bind(usage.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConfidenceScores;

    fn sample_audio_file() -> AudioFile {
        AudioFile {
            id: Uuid::new_v4(),
            file_path: "radio/KXYZ/2026-08-01T12:00:00.mp3".into(),
            station_code: "KXYZ".into(),
            station_name: "Radio XYZ".into(),
            location_state: "Texas".into(),
            location_city: Some("Houston".into()),
            recorded_at: Utc::now(),
            status: ProcessingStatus::New,
            error_message: None,
        }
    }

    fn sample_snippet(audio_file_id: Uuid, stage1_id: Uuid) -> Snippet {
        Snippet {
            id: Uuid::new_v4(),
            audio_file_id,
            stage1_response_id: stage1_id,
            file_path: "snippets/a.mp3".into(),
            recorded_at: Utc::now(),
            duration: "00:01:40".into(),
            start_time: "00:00:30".into(),
            end_time: "00:01:10".into(),
            status: ProcessingStatus::New,
            error_message: None,
            analysis: None,
            analyzed_by: None,
            reviewed_by: None,
            previous_analysis: None,
        }
    }

    fn sample_analysis() -> SnippetAnalysis {
        SnippetAnalysis {
            transcription: "t".into(),
            translation: "t".into(),
            title: "title".into(),
            summary: "summary".into(),
            explanation: "explanation".into(),
            categories: vec!["health".into()],
            keywords: vec![],
            language: "es".into(),
            confidence_scores: ConfidenceScores {
                overall: 80,
                ..Default::default()
            },
            emotional_tone: vec![],
            political_leaning: None,
            context: Default::default(),
            grounding_metadata: None,
        }
    }

    async fn seed_snippet(store: &SqliteTaskStore) -> Snippet {
        let file = sample_audio_file();
        store.insert_audio_file(&file).await.unwrap();
        let stage1 = Stage1Response {
            id: Uuid::new_v4(),
            audio_file_id: file.id,
            timestamped_transcription: None,
            transcribed_by: None,
            initial_detection_result: None,
            detection_result: None,
            status: ProcessingStatus::Processed,
            error_message: None,
        };
        store.insert_stage1_response(&stage1).await.unwrap();
        let snippet = sample_snippet(file.id, stage1.id);
        assert!(store.insert_snippet(&snippet).await.unwrap());
        snippet
    }

    #[tokio::test]
    async fn claim_moves_audio_file_to_processing() {
        let store = SqliteTaskStore::connect_in_memory().await.unwrap();
        let file = sample_audio_file();
        store.insert_audio_file(&file).await.unwrap();

        let claimed = store.claim_next_audio_file().await.unwrap().unwrap();
        assert_eq!(claimed.id, file.id);
        assert_eq!(claimed.status, ProcessingStatus::Processing);

        // The row is no longer claimable.
        assert!(store.claim_next_audio_file().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_takes_oldest_first() {
        let store = SqliteTaskStore::connect_in_memory().await.unwrap();
        let mut newer = sample_audio_file();
        newer.recorded_at = Utc::now();
        let mut older = sample_audio_file();
        older.recorded_at = newer.recorded_at - chrono::Duration::hours(2);
        store.insert_audio_file(&newer).await.unwrap();
        store.insert_audio_file(&older).await.unwrap();

        let first = store.claim_next_audio_file().await.unwrap().unwrap();
        assert_eq!(first.id, older.id);
    }

    #[tokio::test]
    async fn snippet_insert_is_idempotent() {
        let store = SqliteTaskStore::connect_in_memory().await.unwrap();
        let snippet = seed_snippet(&store).await;
        // Same producer-assigned id again: no new row.
        assert!(!store.insert_snippet(&snippet).await.unwrap());
    }

    #[tokio::test]
    async fn review_claim_only_sees_ready_snippets() {
        let store = SqliteTaskStore::connect_in_memory().await.unwrap();
        let snippet = seed_snippet(&store).await;
        assert!(store.claim_next_reviewable_snippet().await.unwrap().is_none());

        store
            .set_snippet_status(snippet.id, ProcessingStatus::ReadyForReview, None)
            .await
            .unwrap();
        let claimed = store.claim_next_reviewable_snippet().await.unwrap().unwrap();
        assert_eq!(claimed.status, ProcessingStatus::Reviewing);
    }

    #[tokio::test]
    async fn unembedded_claim_skips_embedded_snippets() {
        let store = SqliteTaskStore::connect_in_memory().await.unwrap();
        let snippet = seed_snippet(&store).await;
        store
            .set_snippet_status(snippet.id, ProcessingStatus::Processed, None)
            .await
            .unwrap();

        let found = store.claim_next_unembedded_snippet().await.unwrap().unwrap();
        assert_eq!(found.id, snippet.id);

        store
            .upsert_snippet_embedding(&SnippetEmbedding {
                snippet_id: snippet.id,
                document: "doc".into(),
                embedding: vec![0.1, 0.2],
                model_name: "m".into(),
                status: EmbeddingStatus::Processed,
                error_message: None,
            })
            .await
            .unwrap();
        assert!(store.claim_next_unembedded_snippet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn backup_preserves_first_analysis_only() {
        let store = SqliteTaskStore::connect_in_memory().await.unwrap();
        let snippet = seed_snippet(&store).await;

        let mut analysis = sample_analysis();
        store
            .update_snippet_analysis(snippet.id, &analysis, "model-a", ProcessingStatus::ReadyForReview)
            .await
            .unwrap();
        store.backup_snippet_analysis(snippet.id).await.unwrap();

        analysis.title = "revised".into();
        store
            .submit_snippet_review(snippet.id, &analysis, "model-b")
            .await
            .unwrap();
        // A second backup attempt must not clobber the original.
        store.backup_snippet_analysis(snippet.id).await.unwrap();

        let stored = store.get_snippet(snippet.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ProcessingStatus::Processed);
        assert_eq!(stored.analysis.unwrap().title, "revised");
        assert_eq!(stored.previous_analysis.unwrap().title, "title");
        assert_eq!(stored.reviewed_by.as_deref(), Some("model-b"));
    }

    #[tokio::test]
    async fn reset_snippets_clears_analysis_fields() {
        let store = SqliteTaskStore::connect_in_memory().await.unwrap();
        let snippet = seed_snippet(&store).await;
        store
            .update_snippet_analysis(snippet.id, &sample_analysis(), "m", ProcessingStatus::Processed)
            .await
            .unwrap();

        let count = store.reset_snippets(&[snippet.id]).await.unwrap();
        assert_eq!(count, 1);
        let stored = store.get_snippet(snippet.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ProcessingStatus::New);
        assert!(stored.analysis.is_none());
        assert!(stored.analyzed_by.is_none());
    }

    #[tokio::test]
    async fn initial_detection_result_is_write_once() {
        let store = SqliteTaskStore::connect_in_memory().await.unwrap();
        let file = sample_audio_file();
        store.insert_audio_file(&file).await.unwrap();
        let stage1 = Stage1Response {
            id: Uuid::new_v4(),
            audio_file_id: file.id,
            timestamped_transcription: None,
            transcribed_by: None,
            initial_detection_result: None,
            detection_result: None,
            status: ProcessingStatus::New,
            error_message: None,
        };
        store.insert_stage1_response(&stage1).await.unwrap();

        let first = DetectionResult {
            flagged_snippets: vec![],
        };
        store.update_stage1_detection(stage1.id, &first).await.unwrap();

        let redo = DetectionResult {
            flagged_snippets: vec![crate::models::FlaggedSnippet {
                id: Uuid::new_v4(),
                start_time: "00:01:00".into(),
                end_time: "00:02:00".into(),
                transcription: "claim".into(),
                explanation: None,
                categories: vec![],
                keywords: vec![],
            }],
        };
        store.update_stage1_detection(stage1.id, &redo).await.unwrap();

        let stored = store.get_stage1_response(stage1.id).await.unwrap().unwrap();
        assert!(stored.initial_detection_result.unwrap().flagged_snippets.is_empty());
        assert_eq!(stored.detection_result.unwrap().flagged_snippets.len(), 1);
    }

    fn sample_entry(fact: &str) -> KbEntry {
        KbEntry {
            id: Uuid::new_v4(),
            fact: fact.into(),
            confidence_score: 90,
            categories: vec!["health".into()],
            keywords: vec![],
            related_claim: None,
            is_time_sensitive: false,
            valid_from: None,
            valid_until: None,
            status: KbStatus::Active,
            deactivation_reason: None,
            version: 1,
            previous_version: None,
            superseded_by: None,
            created_by_snippet: None,
            created_by_model: "model".into(),
            created_at: Utc::now(),
        }
    }

    fn sample_source() -> FactSource {
        FactSource {
            url: "https://example.org/a".into(),
            name: "Example Wire".into(),
            tier: SourceTier::Tier1WireService,
            title: None,
            excerpt: None,
        }
    }

    #[tokio::test]
    async fn search_scores_and_orders_by_similarity() {
        let store = SqliteTaskStore::connect_in_memory().await.unwrap();
        let close = sample_entry("fact a");
        let far = sample_entry("fact b");
        store
            .insert_entry(&close, &[sample_source()], "Fact: a", &[1.0, 0.0], "m")
            .await
            .unwrap();
        store
            .insert_entry(&far, &[sample_source()], "Fact: b", &[0.0, 1.0], "m")
            .await
            .unwrap();

        let hits = store
            .search_active(&[0.9, 0.1], 0.3, 10, None, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.id, close.id);
        assert_eq!(hits[0].sources.len(), 1);
    }

    #[tokio::test]
    async fn superseded_entries_leave_the_search_set() {
        let store = SqliteTaskStore::connect_in_memory().await.unwrap();
        let old = sample_entry("old fact");
        let new = sample_entry("new fact");
        store
            .insert_entry(&old, &[sample_source()], "Fact: old", &[1.0, 0.0], "m")
            .await
            .unwrap();
        store
            .insert_entry(&new, &[sample_source()], "Fact: new", &[1.0, 0.0], "m")
            .await
            .unwrap();
        store.mark_superseded(old.id, new.id).await.unwrap();

        let hits = store
            .search_active(&[1.0, 0.0], 0.5, 10, None, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.id, new.id);

        let stored = store.get_entry(old.id).await.unwrap().unwrap();
        assert_eq!(stored.status, KbStatus::Superseded);
        assert_eq!(stored.superseded_by, Some(new.id));
    }

    #[tokio::test]
    async fn category_and_time_filters_apply() {
        let store = SqliteTaskStore::connect_in_memory().await.unwrap();
        let mut entry = sample_entry("seasonal fact");
        entry.is_time_sensitive = true;
        entry.valid_until = Some(Utc::now() - chrono::Duration::days(1));
        store
            .insert_entry(&entry, &[sample_source()], "Fact: s", &[1.0, 0.0], "m")
            .await
            .unwrap();

        // Expired for "now".
        let hits = store
            .search_active(&[1.0, 0.0], 0.5, 10, None, Some(Utc::now()))
            .await
            .unwrap();
        assert!(hits.is_empty());

        // Wrong category.
        let hits = store
            .search_active(&[1.0, 0.0], 0.5, 10, Some(&["politics".into()]), None)
            .await
            .unwrap();
        assert!(hits.is_empty());

        // Matching category, no time filter.
        let hits = store
            .search_active(&[1.0, 0.0], 0.5, 10, Some(&["health".into()]), None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn deactivation_is_recorded_with_reason() {
        let store = SqliteTaskStore::connect_in_memory().await.unwrap();
        let entry = sample_entry("wrong fact");
        store
            .insert_entry(&entry, &[sample_source()], "Fact: w", &[1.0], "m")
            .await
            .unwrap();

        assert!(store.deactivate_entry(entry.id, "retracted by source").await.unwrap());
        assert!(!store.deactivate_entry(Uuid::new_v4(), "missing").await.unwrap());

        let stored = store.get_entry(entry.id).await.unwrap().unwrap();
        assert_eq!(stored.status, KbStatus::Deactivated);
        assert_eq!(stored.deactivation_reason.as_deref(), Some("retracted by source"));
    }
}
