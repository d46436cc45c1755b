//! Index of finished transcoding artifacts, keyed by stream fingerprint.
//!
//! Backed by a single embedded SQLite table. Rows are inserted once a stream
//! has been encoded and its manifest written; the remote path is filled in
//! after the artifact reaches object storage. Rows with an empty remote path
//! ("local-only") feed the uploader sweeper.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

mod schema;

pub use schema::{MIGRATE_DOWN, MIGRATE_UP};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database error")]
    Sqlite(#[from] rusqlite::Error),
}

/// A transcoded stream known to the library.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Video {
    pub sd_hash: String,
    pub created_at: DateTime<Utc>,
    pub url: String,
    pub path: String,
    pub remote_path: String,
    #[serde(rename = "type")]
    pub media_type: String,
    pub channel: String,
    pub last_accessed: Option<DateTime<Utc>>,
    pub access_count: i64,
    pub size: i64,
    pub checksum: Option<String>,
}

impl Video {
    /// Whether the artifact exists only on local disk.
    pub fn is_local_only(&self) -> bool {
        self.remote_path.is_empty()
    }
}

/// Parameters for recording a freshly transcoded stream.
#[derive(Debug, Clone)]
pub struct AddParams {
    pub url: String,
    pub sd_hash: String,
    pub media_type: String,
    pub channel: String,
    pub path: String,
    pub size: i64,
    pub checksum: Option<String>,
}

pub struct Library {
    conn: Mutex<Connection>,
}

impl Library {
    /// Open (creating if needed) the library database at `path` and apply
    /// migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// An in-memory library, used by tests.
    pub fn open_in_memory() -> Result<Self, Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, Error> {
        let lib = Self {
            conn: Mutex::new(conn),
        };
        lib.migrate_up()?;
        Ok(lib)
    }

    /// Idempotently create the schema.
    pub fn migrate_up(&self) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(MIGRATE_UP)?;
        Ok(())
    }

    /// Idempotently drop the schema.
    pub fn migrate_down(&self) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(MIGRATE_DOWN)?;
        Ok(())
    }

    /// Fetch a video by fingerprint, bumping its access statistics.
    pub fn get(&self, sd_hash: &str) -> Result<Option<Video>, Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"UPDATE video
               SET last_accessed = ?1, access_count = access_count + 1
               WHERE sd_hash = ?2"#,
            params![Utc::now(), sd_hash],
        )?;
        let video = conn
            .query_row(
                r#"SELECT sd_hash, created_at, url, path, remote_path, "type",
                          channel, last_accessed, access_count, size, checksum
                   FROM video WHERE sd_hash = ?1"#,
                params![sd_hash],
                video_from_row,
            )
            .optional()?;
        Ok(video)
    }

    /// Record a freshly transcoded stream. The remote path starts empty and
    /// is filled in by [`Library::update_remote_path`] after upload.
    ///
    /// Re-recording a fingerprint overwrites the artifact fields: a request
    /// released after a failed upload is re-encoded on its next dispatch.
    pub fn add(&self, params: AddParams) -> Result<Video, Error> {
        let created_at = Utc::now();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO video
               (sd_hash, created_at, url, path, remote_path, "type", channel, size, checksum)
               VALUES (?1, ?2, ?3, ?4, '', ?5, ?6, ?7, ?8)
               ON CONFLICT (sd_hash) DO UPDATE SET
                   url = excluded.url,
                   path = excluded.path,
                   "type" = excluded."type",
                   channel = excluded.channel,
                   size = excluded.size,
                   checksum = excluded.checksum"#,
            params![
                params.sd_hash,
                created_at,
                params.url,
                params.path,
                params.media_type,
                params.channel,
                params.size,
                params.checksum,
            ],
        )?;
        tracing::info!(sd_hash = %params.sd_hash, url = %params.url, size = params.size, "added video");
        Ok(Video {
            sd_hash: params.sd_hash,
            created_at,
            url: params.url,
            path: params.path,
            remote_path: String::new(),
            media_type: params.media_type,
            channel: params.channel,
            last_accessed: None,
            access_count: 0,
            size: params.size,
            checksum: params.checksum,
        })
    }

    /// Record the remote location of an uploaded artifact.
    pub fn update_remote_path(&self, sd_hash: &str, remote_path: &str) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE video SET remote_path = ?1 WHERE sd_hash = ?2",
            params![remote_path, sd_hash],
        )?;
        if updated == 0 {
            return Err(rusqlite::Error::QueryReturnedNoRows.into());
        }
        Ok(())
    }

    /// Videos whose artifacts have not yet been uploaded.
    pub fn list_local_only(&self) -> Result<Vec<Video>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"SELECT sd_hash, created_at, url, path, remote_path, "type",
                      channel, last_accessed, access_count, size, checksum
               FROM video WHERE remote_path = '' ORDER BY created_at"#,
        )?;
        let videos = stmt
            .query_map([], video_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(videos)
    }
}

fn video_from_row(row: &Row<'_>) -> Result<Video, rusqlite::Error> {
    Ok(Video {
        sd_hash: row.get(0)?,
        created_at: row.get(1)?,
        url: row.get(2)?,
        path: row.get(3)?,
        remote_path: row.get(4)?,
        media_type: row.get(5)?,
        channel: row.get(6)?,
        last_accessed: row.get(7)?,
        access_count: row.get(8)?,
        size: row.get(9)?,
        checksum: row.get(10)?,
    })
}
