// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Database module - append-only diagnostic log

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

use crate::config::DatabaseConfig;
use crate::core::{AlertReason, DeviceState, DiagnosticSample};
use crate::error::StoreError;
use crate::geo::GeoPoint;

/// Read/write contract the engine needs from persistence
pub trait DiagnosticStore: Send {
    /// Append a sample; returns once the row is committed
    fn append(&self, sample: &DiagnosticSample) -> Result<(), StoreError>;

    /// Most recently appended sample, if any
    fn latest(&self) -> Result<Option<DiagnosticSample>, StoreError>;
}

/// SQLite-backed diagnostic log
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&config.path)?;

        // FULL sync: an acknowledged append survives power loss
        conn.execute_batch(r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA temp_store = MEMORY;
        "#)?;

        let db = Self::from_connection(conn)?;
        info!("Database opened at {:?}", config.path);
        Ok(db)
    }

    /// Private in-memory database, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.create_tables()?;
        Ok(db)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS diagnostics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                time TEXT NOT NULL,
                state TEXT NOT NULL,
                lat REAL,
                lon REAL,
                battery TEXT NOT NULL,
                reason TEXT NOT NULL,
                source_id TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_diagnostics_time ON diagnostics(time);
        "#)?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Corrupt("connection mutex poisoned".to_string()))
    }

    /// Newest samples first
    pub fn recent(&self, limit: usize) -> Result<Vec<DiagnosticSample>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT time, state, lat, lon, battery, reason, source_id FROM diagnostics
             ORDER BY id DESC LIMIT ?1",
        )?;

        let mut rows = stmt.query(params![limit as i64])?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            results.push(sample_from_row(row)?);
        }

        Ok(results)
    }

    /// Get database statistics
    pub fn get_stats(&self) -> Result<DatabaseStats, StoreError> {
        let conn = self.lock()?;

        let sample_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM diagnostics",
            [],
            |row| row.get(0),
        )?;

        let size_bytes: i64 = conn.query_row(
            "SELECT page_count * page_size as size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        ).unwrap_or(0);

        Ok(DatabaseStats {
            sample_count: sample_count as usize,
            size_bytes: size_bytes as u64,
        })
    }

    /// Delete samples older than the retention window
    pub fn cleanup(&self, retention_days: u32) -> Result<usize, StoreError> {
        let conn = self.lock()?;

        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);

        let deleted = conn.execute(
            "DELETE FROM diagnostics WHERE time < ?1",
            params![cutoff.to_rfc3339()],
        )?;

        if deleted > 0 {
            info!("Cleaned up {} diagnostics older than {} days", deleted, retention_days);
        }

        Ok(deleted)
    }
}

impl DiagnosticStore for Database {
    fn append(&self, sample: &DiagnosticSample) -> Result<(), StoreError> {
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO diagnostics (time, state, lat, lon, battery, reason, source_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                sample.timestamp.to_rfc3339(),
                sample.state.as_str(),
                sample.point.map(|p| p.lat),
                sample.point.map(|p| p.lon),
                sample.battery,
                sample.reason.as_str(),
                sample.source_id,
            ],
        )?;

        Ok(())
    }

    fn latest(&self) -> Result<Option<DiagnosticSample>, StoreError> {
        let conn = self.lock()?;

        let row = conn
            .query_row(
                "SELECT time, state, lat, lon, battery, reason, source_id FROM diagnostics
                 ORDER BY id DESC LIMIT 1",
                [],
                |row| RawSample::from_row(row),
            )
            .optional()?;

        row.map(RawSample::into_sample).transpose()
    }
}

struct RawSample {
    time: String,
    state: String,
    lat: Option<f64>,
    lon: Option<f64>,
    battery: String,
    reason: String,
    source_id: String,
}

impl RawSample {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            time: row.get(0)?,
            state: row.get(1)?,
            lat: row.get(2)?,
            lon: row.get(3)?,
            battery: row.get(4)?,
            reason: row.get(5)?,
            source_id: row.get(6)?,
        })
    }

    fn into_sample(self) -> Result<DiagnosticSample, StoreError> {
        let timestamp = DateTime::parse_from_rfc3339(&self.time)
            .map_err(|e| StoreError::Corrupt(format!("time '{}': {}", self.time, e)))?
            .with_timezone(&Utc);
        let state = DeviceState::parse(&self.state)
            .ok_or_else(|| StoreError::Corrupt(format!("state '{}'", self.state)))?;
        let reason = AlertReason::parse(&self.reason)
            .ok_or_else(|| StoreError::Corrupt(format!("reason '{}'", self.reason)))?;
        let point = match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => GeoPoint::new(lat, lon),
            _ => None,
        };

        Ok(DiagnosticSample {
            timestamp,
            state,
            point,
            battery: self.battery,
            reason,
            source_id: self.source_id,
        })
    }
}

fn sample_from_row(row: &Row<'_>) -> Result<DiagnosticSample, StoreError> {
    RawSample::from_row(row)?.into_sample()
}

#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub sample_count: usize,
    pub size_bytes: u64,
}
