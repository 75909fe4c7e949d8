//! SQLite persistence for the bundle audit log, the cycle blacklist and
//! per-cycle simulation statistics.
//!
//! Uses WAL mode so the CLI can read the audit log while the engine is
//! appending to it.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use eyre::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::types::BundleRecord;

/// Blacklisted cycle with the reason it was removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistEntry {
    pub cycle_id: String,
    pub reason: String,
    pub simulations: u32,
    pub failures: u32,
    pub blacklisted_at: String,
}

/// Persisted simulation counters for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleStats {
    pub simulations: u32,
    pub failures: u32,
    pub gas_estimate: Option<u64>,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Creates or opens a SQLite database with WAL mode enabled.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or migrations fail.
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .wrap_err_with(|| format!("failed to open SQLite database {path}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS submitted_bundles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bundle_hash TEXT NOT NULL,
                cycle_id TEXT NOT NULL,
                target_blocks TEXT NOT NULL,
                signed_transactions TEXT NOT NULL,
                profit_wei TEXT NOT NULL,
                submitted_at TEXT NOT NULL,
                outcome TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_submitted_bundles_cycle
                ON submitted_bundles (cycle_id);

            CREATE TABLE IF NOT EXISTS blacklisted_cycles (
                cycle_id TEXT PRIMARY KEY,
                reason TEXT NOT NULL,
                simulations INTEGER NOT NULL,
                failures INTEGER NOT NULL,
                blacklisted_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cycle_stats (
                cycle_id TEXT PRIMARY KEY,
                simulations INTEGER NOT NULL,
                failures INTEGER NOT NULL,
                gas_estimate INTEGER
            );
            ",
        )?;
        Ok(())
    }

    /// Appends a submitted bundle to the audit log and returns its row id.
    ///
    /// # Errors
    /// Returns error if serialization or the insert fails.
    pub fn record_bundle(&self, record: &BundleRecord) -> Result<i64> {
        let target_blocks = serde_json::to_string(&record.target_blocks)?;
        let signed = serde_json::to_string(&record.signed_transactions)?;
        let conn = self.conn();
        conn.execute(
            "
            INSERT INTO submitted_bundles (
                bundle_hash, cycle_id, target_blocks, signed_transactions, profit_wei, submitted_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            ",
            params![
                record.bundle_hash,
                record.cycle_id,
                target_blocks,
                signed,
                record.profit_wei,
                record.submitted_at,
            ],
        )
        .wrap_err("failed to insert submitted bundle")?;
        Ok(conn.last_insert_rowid())
    }

    /// Records the final outcome (`confirmed` / `dropped`) of a bundle.
    ///
    /// # Errors
    /// Returns error if the update fails.
    pub fn set_bundle_outcome(&self, bundle_hash: &str, outcome: &str) -> Result<usize> {
        let updated = self.conn().execute(
            "UPDATE submitted_bundles SET outcome = ? WHERE bundle_hash = ?",
            params![outcome, bundle_hash],
        )?;
        Ok(updated)
    }

    /// Most recent bundles first, with their outcome if known.
    ///
    /// # Errors
    /// Returns error if the query fails or a row cannot be decoded.
    pub fn recent_bundles(&self, limit: usize) -> Result<Vec<(BundleRecord, Option<String>)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "
            SELECT bundle_hash, cycle_id, target_blocks, signed_transactions,
                   profit_wei, submitted_at, outcome
            FROM submitted_bundles
            ORDER BY id DESC
            LIMIT ?
            ",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;

        let mut bundles = Vec::new();
        for row in rows {
            let (bundle_hash, cycle_id, blocks, signed, profit_wei, submitted_at, outcome) = row?;
            let record = BundleRecord {
                bundle_hash,
                cycle_id,
                target_blocks: serde_json::from_str(&blocks)
                    .wrap_err("corrupt target_blocks column")?,
                signed_transactions: serde_json::from_str(&signed)
                    .wrap_err("corrupt signed_transactions column")?,
                profit_wei,
                submitted_at,
            };
            bundles.push((record, outcome));
        }
        Ok(bundles)
    }

    /// Inserts or replaces a blacklist entry.
    ///
    /// # Errors
    /// Returns error if the insert fails.
    pub fn blacklist_cycle(&self, entry: &BlacklistEntry) -> Result<()> {
        self.conn().execute(
            "
            INSERT OR REPLACE INTO blacklisted_cycles (
                cycle_id, reason, simulations, failures, blacklisted_at
            ) VALUES (?, ?, ?, ?, ?)
            ",
            params![
                entry.cycle_id,
                entry.reason,
                entry.simulations,
                entry.failures,
                entry.blacklisted_at,
            ],
        )?;
        Ok(())
    }

    /// Removes a cycle from the blacklist. Returns whether it was present.
    ///
    /// # Errors
    /// Returns error if the delete fails.
    pub fn unblacklist_cycle(&self, cycle_id: &str) -> Result<bool> {
        let removed = self.conn().execute(
            "DELETE FROM blacklisted_cycles WHERE cycle_id = ?",
            params![cycle_id],
        )?;
        Ok(removed > 0)
    }

    /// # Errors
    /// Returns error if the query fails.
    pub fn blacklisted_ids(&self) -> Result<HashSet<String>> {
        Ok(self
            .blacklist()?
            .into_iter()
            .map(|entry| entry.cycle_id)
            .collect())
    }

    /// # Errors
    /// Returns error if the query fails.
    pub fn blacklist(&self) -> Result<Vec<BlacklistEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "
            SELECT cycle_id, reason, simulations, failures, blacklisted_at
            FROM blacklisted_cycles
            ORDER BY blacklisted_at, cycle_id
            ",
        )?;
        let entries = stmt
            .query_map([], |row| {
                Ok(BlacklistEntry {
                    cycle_id: row.get(0)?,
                    reason: row.get(1)?,
                    simulations: row.get(2)?,
                    failures: row.get(3)?,
                    blacklisted_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// # Errors
    /// Returns error if the upsert fails.
    pub fn save_cycle_stats(&self, cycle_id: &str, stats: CycleStats) -> Result<()> {
        self.conn().execute(
            "
            INSERT INTO cycle_stats (cycle_id, simulations, failures, gas_estimate)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(cycle_id) DO UPDATE SET
                simulations = excluded.simulations,
                failures = excluded.failures,
                gas_estimate = excluded.gas_estimate
            ",
            params![
                cycle_id,
                stats.simulations,
                stats.failures,
                stats.gas_estimate.map(|gas| gas as i64),
            ],
        )?;
        Ok(())
    }

    /// # Errors
    /// Returns error if the query fails.
    pub fn cycle_stats(&self, cycle_id: &str) -> Result<Option<CycleStats>> {
        let stats = self
            .conn()
            .query_row(
                "SELECT simulations, failures, gas_estimate FROM cycle_stats WHERE cycle_id = ?",
                params![cycle_id],
                |row| {
                    Ok(CycleStats {
                        simulations: row.get(0)?,
                        failures: row.get(1)?,
                        gas_estimate: row.get::<_, Option<i64>>(2)?.map(|gas| gas as u64),
                    })
                },
            )
            .optional()?;
        Ok(stats)
    }
}
