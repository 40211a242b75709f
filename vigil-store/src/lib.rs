//! SQLite persistence for events and the person gallery.
//!
//! One `Store` wraps one connection. The database runs in WAL journal mode
//! so encode workers can read the gallery while another worker commits;
//! writers are serialized by SQLite itself.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Local};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use vigil_types::{EventKind, FeatureVec};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("sqlite error: {source}")]
    Sqlite {
        #[from]
        source: rusqlite::Error,
    },
    #[error("stored feature blob is corrupt: {source}")]
    CorruptFeature {
        #[from]
        source: vigil_types::Error,
    },
    #[error("person {0} vanished during reconciliation")]
    NoSuchPerson(i64),
    #[error("stored event type is unknown: {0}")]
    UnknownEventType(String),
}

type Result<T> = std::result::Result<T, Error>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    event_type TEXT NOT NULL,
    video_path TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'unreviewed',
    person_id INTEGER REFERENCES persons(id)
);
CREATE INDEX IF NOT EXISTS idx_events_video_path ON events(video_path);
CREATE INDEX IF NOT EXISTS idx_events_person_id ON events(person_id);
CREATE TABLE IF NOT EXISTS persons (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    sighting_count INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS person_features (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    feature BLOB NOT NULL,
    person_id INTEGER NOT NULL REFERENCES persons(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_person_features_person_id
    ON person_features(person_id);
";

/// One gallery identity with all of its stored feature vectors, in
/// insertion order.
#[derive(Debug, Clone)]
pub struct GalleryPerson {
    pub id: i64,
    pub sighting_count: i64,
    pub features: Vec<FeatureVec>,
}

/// A persisted event row.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub id: i64,
    pub timestamp: DateTime<Local>,
    pub event_type: EventKind,
    pub video_path: String,
    pub status: String,
    pub person_id: Option<i64>,
}

/// Append features to an existing person and count one sighting.
#[derive(Debug, Clone)]
pub struct PersonUpdate {
    pub person_id: i64,
    pub features: Vec<FeatureVec>,
}

/// Which person the event's first cluster resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanRef {
    Existing(i64),
    New(usize),
}

/// The full set of gallery mutations for one event, applied in a single
/// transaction. Produced by the reconciliation logic, which never touches
/// SQL itself.
#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    /// Feature sets for persons to create, in cluster order.
    pub new_persons: Vec<Vec<FeatureVec>>,
    /// Existing persons to extend. At most one entry per person.
    pub updates: Vec<PersonUpdate>,
    pub primary: Option<PlanRef>,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if necessary) the database at `path` and ensure the
    /// schema exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(Duration::from_secs(15))?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
        debug!("database journal mode: {mode}");
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        info!("database ready at {}", path.as_ref().display());
        Ok(Self { conn })
    }

    /// In-memory database with the same schema, for tests and tooling.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Record a finished event. Its own commit, independent of any gallery
    /// transaction.
    pub fn insert_event(
        &self,
        timestamp: DateTime<Local>,
        kind: EventKind,
        video_path: &str,
        person_id: Option<i64>,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO events (timestamp, event_type, video_path, person_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![timestamp, kind.as_str(), video_path, person_id],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_event(&self, id: i64) -> Result<Option<EventRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, timestamp, event_type, video_path, status, person_id
                 FROM events WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, DateTime<Local>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((id, timestamp, kind, video_path, status, person_id)) => Ok(Some(EventRow {
                id,
                timestamp,
                event_type: kind
                    .parse()
                    .map_err(|_| Error::UnknownEventType(kind.clone()))?,
                video_path,
                status,
                person_id,
            })),
        }
    }

    /// Load the whole gallery snapshot: every person with every feature,
    /// in insertion order.
    pub fn load_gallery(&self) -> Result<Vec<GalleryPerson>> {
        let mut persons: Vec<GalleryPerson> = Vec::new();
        {
            let mut stmt = self
                .conn
                .prepare("SELECT id, sighting_count FROM persons ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                Ok(GalleryPerson {
                    id: row.get(0)?,
                    sighting_count: row.get(1)?,
                    features: Vec::new(),
                })
            })?;
            for row in rows {
                persons.push(row?);
            }
        }
        let mut stmt = self
            .conn
            .prepare("SELECT person_id, feature FROM person_features ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        for row in rows {
            let (person_id, blob) = row?;
            let feature = FeatureVec::from_bytes(&blob)?;
            if let Some(person) = persons.iter_mut().find(|p| p.id == person_id) {
                person.features.push(feature);
            }
        }
        Ok(persons)
    }

    /// Apply a reconciliation plan in one transaction.
    ///
    /// Returns the database id of the plan's primary person. On any error
    /// the transaction rolls back and nothing is visible.
    pub fn apply_reconcile(
        &mut self,
        plan: &ReconcilePlan,
        now: DateTime<Local>,
    ) -> Result<Option<i64>> {
        let tx = self.conn.transaction()?;
        let mut new_ids = Vec::with_capacity(plan.new_persons.len());
        for features in &plan.new_persons {
            tx.execute(
                "INSERT INTO persons (first_seen, last_seen, sighting_count)
                 VALUES (?1, ?1, 1)",
                params![now],
            )?;
            let person_id = tx.last_insert_rowid();
            for feature in features {
                tx.execute(
                    "INSERT INTO person_features (feature, person_id) VALUES (?1, ?2)",
                    params![feature.to_bytes(), person_id],
                )?;
            }
            new_ids.push(person_id);
        }
        for update in &plan.updates {
            for feature in &update.features {
                tx.execute(
                    "INSERT INTO person_features (feature, person_id) VALUES (?1, ?2)",
                    params![feature.to_bytes(), update.person_id],
                )?;
            }
            let changed = tx.execute(
                "UPDATE persons SET sighting_count = sighting_count + 1, last_seen = ?1
                 WHERE id = ?2",
                params![now, update.person_id],
            )?;
            if changed == 0 {
                return Err(Error::NoSuchPerson(update.person_id));
            }
        }
        let primary = match plan.primary {
            None => None,
            Some(PlanRef::Existing(id)) => Some(id),
            Some(PlanRef::New(idx)) => Some(new_ids[idx]),
        };
        tx.commit()?;
        Ok(primary)
    }

    /// Delete a person; their features cascade away with them.
    pub fn delete_person(&self, person_id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM persons WHERE id = ?1", params![person_id])?;
        Ok(())
    }

    pub fn event_count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?)
    }

    pub fn person_count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM persons", [], |r| r.get(0))?)
    }

    pub fn feature_count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM person_features", [], |r| r.get(0))?)
    }
}
