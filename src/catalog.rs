//! Catalog persistence layer.
//!
//! Content records, admin users and the upload log all live in one SQLite
//! file. Seasons and episodes are nested inside a content record, so they are
//! stored as a JSON column rather than as separate tables; the record is always
//! read and written as a whole.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::alist::LinkKind;
use crate::auth::PasswordDigest;

/// A single playable episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    pub episode_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Season {
    pub season_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub episodes: Vec<Episode>,
}

/// A catalog entry as stored and as returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    #[serde(rename = "_id")]
    pub id: String,
    pub title: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drive_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seasons: Option<Vec<Season>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Body accepted by the create and update endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentPayload {
    pub title: String,
    pub category: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub release_year: Option<i32>,
    #[serde(default)]
    pub drive_link: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub seasons: Option<Vec<Season>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Validation error: {} at \"{}\"", self.message, self.field)
    }
}

impl std::error::Error for ValidationError {}

const MIN_RELEASE_YEAR: i32 = 1800;
const MAX_RELEASE_YEAR: i32 = 2200;

impl ContentPayload {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |field: String, message: &str| ValidationError {
            field,
            message: message.to_owned(),
        };

        if self.title.trim().is_empty() {
            return Err(invalid("title".into(), "Title is required"));
        }
        if self.category.trim().is_empty() {
            return Err(invalid("category".into(), "Category is required"));
        }
        if let Some(year) = self.release_year
            && !(MIN_RELEASE_YEAR..=MAX_RELEASE_YEAR).contains(&year)
        {
            return Err(invalid("releaseYear".into(), "Release year is out of range"));
        }
        for (season_idx, season) in self.seasons.iter().flatten().enumerate() {
            for (episode_idx, episode) in season.episodes.iter().enumerate() {
                if episode.link.trim().is_empty() {
                    return Err(invalid(
                        format!("seasons[{season_idx}].episodes[{episode_idx}].link"),
                        "Episode link is required",
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadLogEntry {
    pub id: i64,
    pub content_title: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Result of rewriting stored Alist host URLs into plain paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub updated: usize,
    pub errors: Vec<String>,
}

/// Handle on the catalog database. Cloning is cheap: every operation opens
/// its own short-lived connection, so the handle can be moved into blocking
/// tasks freely.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    db_path: PathBuf,
}

impl CatalogStore {
    /// Opens (and if necessary creates) the database and its schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating catalog directory {}", parent.display()))?;
        }

        let store = Self {
            db_path: path.to_path_buf(),
        };
        let mut conn = store.connect()?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL mode for catalog DB")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("setting catalog DB synchronous mode")?;
        ensure_tables(&mut conn)?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection> {
        Connection::open(&self.db_path)
            .with_context(|| format!("opening catalog DB {}", self.db_path.display()))
    }

    fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self.connect()?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        f(&mut conn)
    }

    /// Every content record, newest first.
    pub fn list_content(&self) -> Result<Vec<ContentItem>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONTENT_COLUMNS} FROM content ORDER BY created_at DESC, rowid DESC"
            ))?;
            let mut rows = stmt.query([])?;
            let mut items = Vec::new();
            while let Some(row) = rows.next()? {
                items.push(row_to_content(row)?);
            }
            Ok(items)
        })
    }

    /// Unknown and malformed identifiers both come back as `None`.
    pub fn get_content(&self, id: &str) -> Result<Option<ContentItem>> {
        let Some(id) = parse_id(id) else {
            return Ok(None);
        };
        self.with_connection(|conn| fetch_content(conn, &id))
    }

    pub fn create_content(&self, payload: &ContentPayload) -> Result<ContentItem> {
        let created_at = now();
        let item = ContentItem {
            id: Uuid::new_v4().to_string(),
            title: payload.title.trim().to_owned(),
            category: payload.category.trim().to_owned(),
            description: payload.description.clone(),
            release_year: payload.release_year,
            drive_link: payload.drive_link.clone(),
            thumbnail: payload.thumbnail.clone(),
            seasons: payload.seasons.clone(),
            created_at,
            updated_at: created_at,
        };
        let seasons_json = seasons_to_json(&item.seasons)?;

        self.with_connection(|conn| {
            conn.execute(
                r#"
                INSERT INTO content (
                    id, title, category, description, release_year,
                    drive_link, thumbnail, seasons_json, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    item.id,
                    item.title,
                    item.category,
                    item.description,
                    item.release_year,
                    item.drive_link,
                    item.thumbnail,
                    seasons_json,
                    timestamp(item.created_at),
                    timestamp(item.updated_at),
                ],
            )
            .context("inserting content record")?;
            Ok(())
        })?;

        Ok(item)
    }

    /// Replaces every field of an existing record. `None` when it is absent.
    pub fn update_content(
        &self,
        id: &str,
        payload: &ContentPayload,
    ) -> Result<Option<ContentItem>> {
        let Some(id) = parse_id(id) else {
            return Ok(None);
        };
        let seasons_json = seasons_to_json(&payload.seasons)?;

        self.with_connection(|conn| {
            let changed = conn
                .execute(
                    r#"
                    UPDATE content SET
                        title = ?2,
                        category = ?3,
                        description = ?4,
                        release_year = ?5,
                        drive_link = ?6,
                        thumbnail = ?7,
                        seasons_json = ?8,
                        updated_at = ?9
                    WHERE id = ?1
                    "#,
                    params![
                        id,
                        payload.title.trim(),
                        payload.category.trim(),
                        payload.description,
                        payload.release_year,
                        payload.drive_link,
                        payload.thumbnail,
                        seasons_json,
                        timestamp(now()),
                    ],
                )
                .context("updating content record")?;
            if changed == 0 {
                return Ok(None);
            }
            fetch_content(conn, &id)
        })
    }

    pub fn delete_content(&self, id: &str) -> Result<bool> {
        let Some(id) = parse_id(id) else {
            return Ok(false);
        };
        self.with_connection(|conn| {
            let removed = conn
                .execute("DELETE FROM content WHERE id = ?1", params![id])
                .context("deleting content record")?;
            Ok(removed > 0)
        })
    }

    /// Case-insensitive substring match on title and description, optionally
    /// restricted to one category.
    pub fn search_content(&self, query: &str, category: Option<&str>) -> Result<Vec<ContentItem>> {
        let pattern = format!("%{}%", escape_like(query.trim()));
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                r#"
                SELECT {CONTENT_COLUMNS}
                FROM content
                WHERE (title LIKE ?1 ESCAPE '\' OR IFNULL(description, '') LIKE ?1 ESCAPE '\')
                  AND (?2 IS NULL OR category = ?2 COLLATE NOCASE)
                ORDER BY created_at DESC, rowid DESC
                "#
            ))?;
            let mut rows = stmt.query(params![pattern, category])?;
            let mut items = Vec::new();
            while let Some(row) = rows.next()? {
                items.push(row_to_content(row)?);
            }
            Ok(items)
        })
    }

    pub fn create_user(&self, username: &str, password: &str) -> Result<User> {
        let username = username.trim();
        if username.is_empty() {
            bail!("username must not be empty");
        }
        if password.is_empty() {
            bail!("password must not be empty");
        }
        let digest = PasswordDigest::generate(password);
        let user = User {
            id: Uuid::new_v4().to_string(),
            username: username.to_owned(),
        };

        self.with_connection(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1)",
                params![user.username],
                |row| row.get(0),
            )?;
            if exists {
                bail!("user {} already exists", user.username);
            }
            conn.execute(
                r#"
                INSERT INTO users (id, username, password_salt, password_hash, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    user.id,
                    user.username,
                    digest.salt,
                    digest.hash,
                    timestamp(now())
                ],
            )
            .with_context(|| format!("inserting user {}", user.username))?;
            Ok(())
        })?;

        Ok(user)
    }

    /// Creates the user unless one with that name exists. Returns whether a
    /// user was created; an existing password is never touched.
    pub fn ensure_user(&self, username: &str, password: &str) -> Result<bool> {
        let exists = self.with_connection(|conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1)",
                params![username.trim()],
                |row| row.get::<_, bool>(0),
            )
            .context("checking for existing user")
        })?;
        if exists {
            return Ok(false);
        }
        self.create_user(username, password)?;
        Ok(true)
    }

    /// Returns the user when the credentials match, `None` otherwise.
    pub fn verify_password(&self, username: &str, password: &str) -> Result<Option<User>> {
        let stored = self.with_connection(|conn| {
            conn.query_row(
                r#"
                SELECT id, username, password_salt, password_hash
                FROM users
                WHERE username = ?1
                "#,
                params![username.trim()],
                |row| {
                    Ok((
                        User {
                            id: row.get(0)?,
                            username: row.get(1)?,
                        },
                        PasswordDigest {
                            salt: row.get(2)?,
                            hash: row.get(3)?,
                        },
                    ))
                },
            )
            .optional()
            .context("looking up user")
        })?;

        let Some((user, digest)) = stored else {
            return Ok(None);
        };
        Ok(digest.verify(password)?.then_some(user))
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT id, username FROM users WHERE id = ?1",
                params![id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        username: row.get(1)?,
                    })
                },
            )
            .optional()
            .context("looking up user by id")
        })
    }

    pub fn count_users(&self) -> Result<u64> {
        self.with_connection(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
            Ok(count as u64)
        })
    }

    pub fn record_upload(&self, content_title: &str) -> Result<UploadLogEntry> {
        let uploaded_at = now();
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO upload_logs (content_title, uploaded_at) VALUES (?1, ?2)",
                params![content_title, timestamp(uploaded_at)],
            )
            .context("recording upload")?;
            Ok(UploadLogEntry {
                id: conn.last_insert_rowid(),
                content_title: content_title.to_owned(),
                uploaded_at,
            })
        })
    }

    /// Most recent uploads first.
    pub fn list_uploads(&self, limit: usize) -> Result<Vec<UploadLogEntry>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT id, content_title, uploaded_at
                FROM upload_logs
                ORDER BY id DESC
                LIMIT ?1
                "#,
            )?;
            let mut rows = stmt.query(params![limit as i64])?;
            let mut entries = Vec::new();
            while let Some(row) = rows.next()? {
                entries.push(UploadLogEntry {
                    id: row.get(0)?,
                    content_title: row.get(1)?,
                    uploaded_at: parse_timestamp(&row.get::<_, String>(2)?)?,
                });
            }
            Ok(entries)
        })
    }

    /// Rewrites links stored as absolute Alist URLs into decoded root-relative
    /// paths so that reads sign them. A record that cannot be processed is
    /// reported and skipped; the rest are committed together.
    pub fn fix_alist_paths(&self, host_markers: &[String]) -> Result<MigrationReport> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            let mut report = MigrationReport::default();

            let rows: Vec<(String, Option<String>, Option<String>, Option<String>)> = {
                let mut stmt =
                    tx.prepare("SELECT id, drive_link, thumbnail, seasons_json FROM content")?;
                let mapped = stmt.query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?;
                mapped.collect::<rusqlite::Result<_>>()?
            };

            for (id, drive_link, thumbnail, seasons_json) in rows {
                let mut seasons = match seasons_json.as_deref().map(serde_json::from_str::<Vec<Season>>) {
                    Some(Ok(seasons)) => Some(seasons),
                    Some(Err(err)) => {
                        report.errors.push(format!("{id}: unreadable seasons: {err}"));
                        continue;
                    }
                    None => None,
                };

                let mut changed = 0;
                let drive_link = rewrite_slot(drive_link, host_markers, &mut changed);
                let thumbnail = rewrite_slot(thumbnail, host_markers, &mut changed);
                for episode in seasons
                    .iter_mut()
                    .flatten()
                    .flat_map(|season| season.episodes.iter_mut())
                {
                    if let Some(path) = alist_url_path(&episode.link, host_markers) {
                        episode.link = path;
                        changed += 1;
                    }
                }

                if changed == 0 {
                    continue;
                }

                let seasons_json = match seasons_to_json(&seasons) {
                    Ok(json) => json,
                    Err(err) => {
                        report.errors.push(format!("{id}: {err:#}"));
                        continue;
                    }
                };
                match tx.execute(
                    r#"
                    UPDATE content
                    SET drive_link = ?2, thumbnail = ?3, seasons_json = ?4, updated_at = ?5
                    WHERE id = ?1
                    "#,
                    params![id, drive_link, thumbnail, seasons_json, timestamp(now())],
                ) {
                    Ok(_) => report.updated += changed,
                    Err(err) => report.errors.push(format!("{id}: {err}")),
                }
            }

            tx.commit()?;
            Ok(report)
        })
    }
}

const CONTENT_COLUMNS: &str = "id, title, category, description, release_year, \
     drive_link, thumbnail, seasons_json, created_at, updated_at";

/// Runs the schema SQL in one transaction so a failure leaves the DB untouched.
fn ensure_tables(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS content (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            category TEXT NOT NULL,
            description TEXT,
            release_year INTEGER,
            drive_link TEXT,
            thumbnail TEXT,
            seasons_json TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_content_created ON content(created_at);
        CREATE INDEX IF NOT EXISTS idx_content_category ON content(category);

        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            password_salt TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS upload_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            content_title TEXT NOT NULL,
            uploaded_at TEXT NOT NULL
        );
        "#,
    )
    .context("creating catalog schema")?;
    tx.commit()?;
    Ok(())
}

fn fetch_content(conn: &Connection, id: &str) -> Result<Option<ContentItem>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONTENT_COLUMNS} FROM content WHERE id = ?1"
    ))?;
    let mut rows = stmt.query([id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_content(row)?)),
        None => Ok(None),
    }
}

/// Identifiers are UUIDs; anything else cannot name a record.
fn parse_id(id: &str) -> Option<String> {
    Uuid::parse_str(id.trim()).ok().map(|uuid| uuid.to_string())
}

fn escape_like(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len());
    for ch in query.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn seasons_to_json(seasons: &Option<Vec<Season>>) -> Result<Option<String>> {
    seasons
        .as_ref()
        .map(|seasons| serde_json::to_string(seasons).context("serializing seasons"))
        .transpose()
}

/// Stored timestamps carry microseconds, so values are truncated up front to
/// compare equal after a round trip.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .with_context(|| format!("parsing stored timestamp {value:?}"))
}

fn alist_url_path(link: &str, host_markers: &[String]) -> Option<String> {
    match LinkKind::classify(link, host_markers) {
        LinkKind::AlistUrl(path) => Some(path),
        _ => None,
    }
}

fn rewrite_slot(
    slot: Option<String>,
    host_markers: &[String],
    changed: &mut usize,
) -> Option<String> {
    let link = slot?;
    match alist_url_path(&link, host_markers) {
        Some(path) => {
            *changed += 1;
            Some(path)
        }
        None => Some(link),
    }
}

/// Converts a SQL row into a `ContentItem`, deserializing the seasons column.
fn row_to_content(row: &Row<'_>) -> Result<ContentItem> {
    let seasons_json: Option<String> = row.get("seasons_json")?;
    let seasons = seasons_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .context("parsing stored seasons JSON")?;

    Ok(ContentItem {
        id: row.get("id")?,
        title: row.get("title")?,
        category: row.get("category")?,
        description: row.get("description")?,
        release_year: row.get("release_year")?,
        drive_link: row.get("drive_link")?,
        thumbnail: row.get("thumbnail")?,
        seasons,
        created_at: parse_timestamp(&row.get::<_, String>("created_at")?)?,
        updated_at: parse_timestamp(&row.get::<_, String>("updated_at")?)?,
    })
}
