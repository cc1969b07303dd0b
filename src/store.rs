//! Evidence store: relational access to scans, findings, weakness
//! categories, and curated knowledge entries.
//!
//! Backed by SQLite behind a `Mutex<Connection>`. Reads dominate; the only
//! mutation on the query path is the knowledge usage counter, done as a
//! single SQL UPDATE so concurrent identical queries cannot lose updates.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::{Result, ScanSageError};

/// One recorded security scan, linked to the workflow run that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scan {
    pub scan_id: Uuid,
    pub workflow_id: String,
    pub run_id: Option<String>,
    pub team: String,
    pub project: Option<String>,
    pub scan_type: Option<String>,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One finding produced by a scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub finding_id: Uuid,
    pub scan_id: Uuid,
    pub cwe_id: String,
    pub severity: String,
    pub title: String,
    pub description: Option<String>,
}

/// Aggregated weakness-category row: totals over a team/time window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeaknessStat {
    pub cwe_id: String,
    pub name: String,
    pub total_count: i64,
    pub critical_count: i64,
    pub high_count: i64,
}

/// Curated question/answer pair. A NULL team applies to all teams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub kb_id: Uuid,
    pub question: String,
    pub answer: String,
    pub team: Option<String>,
    pub created_by: Option<String>,
    pub usage_count: i64,
    pub is_active: bool,
}

/// Set-difference summary between two scans' finding sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanComparison {
    pub scan_id_left: Uuid,
    pub scan_id_right: Uuid,
    pub new_count: usize,
    pub resolved_count: usize,
    pub summary: String,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS scans (
    scan_id       TEXT PRIMARY KEY,
    workflow_id   TEXT NOT NULL,
    run_id        TEXT,
    team          TEXT NOT NULL,
    project       TEXT,
    scan_type     TEXT,
    status        TEXT NOT NULL,
    started_at    TEXT NOT NULL,
    completed_at  TEXT
);
CREATE INDEX IF NOT EXISTS idx_scans_workflow ON scans(workflow_id);
CREATE INDEX IF NOT EXISTS idx_scans_team_started ON scans(team, started_at);

CREATE TABLE IF NOT EXISTS cwes (
    cwe_id  TEXT PRIMARY KEY,
    name    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS findings (
    finding_id  TEXT PRIMARY KEY,
    scan_id     TEXT NOT NULL REFERENCES scans(scan_id),
    cwe_id      TEXT NOT NULL REFERENCES cwes(cwe_id),
    severity    TEXT NOT NULL,
    title       TEXT NOT NULL,
    description TEXT
);
CREATE INDEX IF NOT EXISTS idx_findings_scan ON findings(scan_id);

CREATE TABLE IF NOT EXISTS knowledge_entries (
    kb_id       TEXT PRIMARY KEY,
    question    TEXT NOT NULL,
    answer      TEXT NOT NULL,
    team        TEXT,
    created_by  TEXT,
    usage_count INTEGER NOT NULL DEFAULT 0,
    is_active   INTEGER NOT NULL DEFAULT 1,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
";

/// Read-mostly store over the scans/findings/knowledge schema.
pub struct EvidenceStore {
    db: Mutex<Connection>,
}

impl EvidenceStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Connection::open(path.as_ref())?;
        db.execute_batch(SCHEMA)?;
        info!("Evidence store opened at {}", path.as_ref().display());
        Ok(Self { db: Mutex::new(db) })
    }

    /// In-memory store, used by tests and the demo seeder.
    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        db.execute_batch(SCHEMA)?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| ScanSageError::Database("store lock poisoned".to_string()))
    }

    // --- scans -----------------------------------------------------------

    pub fn insert_scan(&self, scan: &Scan) -> Result<()> {
        let db = self.lock()?;
        db.execute(
            "INSERT INTO scans (scan_id, workflow_id, run_id, team, project, scan_type, status, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                scan.scan_id.to_string(),
                scan.workflow_id,
                scan.run_id,
                scan.team,
                scan.project,
                scan.scan_type,
                scan.status,
                scan.started_at.to_rfc3339(),
                scan.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn scan_by_id(&self, scan_id: Uuid) -> Result<Option<Scan>> {
        let db = self.lock()?;
        let scan = db
            .query_row(
                "SELECT scan_id, workflow_id, run_id, team, project, scan_type, status, started_at, completed_at
                 FROM scans WHERE scan_id = ?1",
                params![scan_id.to_string()],
                row_to_scan,
            )
            .optional()?;
        Ok(scan)
    }

    pub fn scan_by_workflow_id(&self, workflow_id: &str) -> Result<Option<Scan>> {
        let db = self.lock()?;
        let scan = db
            .query_row(
                "SELECT scan_id, workflow_id, run_id, team, project, scan_type, status, started_at, completed_at
                 FROM scans WHERE workflow_id = ?1 ORDER BY started_at DESC LIMIT 1",
                params![workflow_id],
                row_to_scan,
            )
            .optional()?;
        Ok(scan)
    }

    pub fn latest_scan_by_team(&self, team: &str) -> Result<Option<Scan>> {
        let db = self.lock()?;
        let scan = db
            .query_row(
                "SELECT scan_id, workflow_id, run_id, team, project, scan_type, status, started_at, completed_at
                 FROM scans WHERE team = ?1 ORDER BY started_at DESC LIMIT 1",
                params![team],
                row_to_scan,
            )
            .optional()?;
        Ok(scan)
    }

    pub fn latest_scan_by_status(&self, status: &str) -> Result<Option<Scan>> {
        let db = self.lock()?;
        let scan = db
            .query_row(
                "SELECT scan_id, workflow_id, run_id, team, project, scan_type, status, started_at, completed_at
                 FROM scans WHERE status = ?1 ORDER BY started_at DESC LIMIT 1",
                params![status],
                row_to_scan,
            )
            .optional()?;
        Ok(scan)
    }

    fn latest_scan_by_team_and_status(&self, team: &str, status: &str) -> Result<Option<Scan>> {
        let db = self.lock()?;
        let scan = db
            .query_row(
                "SELECT scan_id, workflow_id, run_id, team, project, scan_type, status, started_at, completed_at
                 FROM scans WHERE team = ?1 AND status = ?2 ORDER BY started_at DESC LIMIT 1",
                params![team, status],
                row_to_scan,
            )
            .optional()?;
        Ok(scan)
    }

    // --- findings --------------------------------------------------------

    pub fn insert_cwe(&self, cwe_id: &str, name: &str) -> Result<()> {
        let db = self.lock()?;
        db.execute(
            "INSERT OR REPLACE INTO cwes (cwe_id, name) VALUES (?1, ?2)",
            params![cwe_id, name],
        )?;
        Ok(())
    }

    pub fn insert_finding(&self, finding: &Finding) -> Result<()> {
        let db = self.lock()?;
        db.execute(
            "INSERT INTO findings (finding_id, scan_id, cwe_id, severity, title, description)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                finding.finding_id.to_string(),
                finding.scan_id.to_string(),
                finding.cwe_id,
                finding.severity,
                finding.title,
                finding.description,
            ],
        )?;
        Ok(())
    }

    pub fn finding_by_id(&self, finding_id: Uuid) -> Result<Option<Finding>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT finding_id, scan_id, cwe_id, severity, title, description
             FROM findings WHERE finding_id = ?1",
        )?;
        let mut rows = stmt.query_map(params![finding_id.to_string()], row_to_finding)?;
        rows.next().transpose().map_err(Into::into)
    }

    pub fn findings_by_scan(&self, scan_id: Uuid) -> Result<Vec<Finding>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT finding_id, scan_id, cwe_id, severity, title, description
             FROM findings WHERE scan_id = ?1",
        )?;
        let findings = stmt
            .query_map(params![scan_id.to_string()], row_to_finding)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(findings)
    }

    /// Weakness categories ranked by total finding count for a team within
    /// a time window, with critical/high sub-counts.
    pub fn top_weaknesses(
        &self,
        team: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WeaknessStat>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT f.cwe_id, c.name, COUNT(*) AS total,
                    COUNT(CASE WHEN f.severity = 'CRITICAL' THEN 1 END) AS critical,
                    COUNT(CASE WHEN f.severity = 'HIGH' THEN 1 END) AS high
             FROM findings f
             JOIN scans s ON f.scan_id = s.scan_id
             JOIN cwes c ON f.cwe_id = c.cwe_id
             WHERE s.team = ?1 AND s.started_at >= ?2 AND s.started_at <= ?3
             GROUP BY f.cwe_id, c.name
             ORDER BY total DESC
             LIMIT ?4",
        )?;
        let stats = stmt
            .query_map(
                params![team, since.to_rfc3339(), until.to_rfc3339(), limit as i64],
                |row| {
                    Ok(WeaknessStat {
                        cwe_id: row.get(0)?,
                        name: row.get(1)?,
                        total_count: row.get(2)?,
                        critical_count: row.get(3)?,
                        high_count: row.get(4)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(stats)
    }

    // --- scan comparison ---------------------------------------------------

    /// Symmetric set difference over finding ids: findings only in the right
    /// scan are "new", only in the left are "resolved". Swapping the
    /// arguments swaps the two counts exactly.
    pub fn compare_scans(&self, left: Uuid, right: Uuid) -> Result<ScanComparison> {
        if self.scan_by_id(left)?.is_none() {
            return Err(ScanSageError::NotFound(format!("scan {}", left)));
        }
        if self.scan_by_id(right)?.is_none() {
            return Err(ScanSageError::NotFound(format!("scan {}", right)));
        }

        let left_ids: HashSet<Uuid> = self
            .findings_by_scan(left)?
            .into_iter()
            .map(|f| f.finding_id)
            .collect();
        let right_ids: HashSet<Uuid> = self
            .findings_by_scan(right)?
            .into_iter()
            .map(|f| f.finding_id)
            .collect();

        let new_count = right_ids.difference(&left_ids).count();
        let resolved_count = left_ids.difference(&right_ids).count();

        Ok(ScanComparison {
            scan_id_left: left,
            scan_id_right: right,
            new_count,
            resolved_count,
            summary: format!(
                "Found {} new findings and {} resolved findings between scans",
                new_count, resolved_count
            ),
        })
    }

    /// Diff the most recent COMPLETED scan against the most recent scan for
    /// the team.
    pub fn changes_since_last_green(&self, team: &str) -> Result<ScanComparison> {
        let green = self
            .latest_scan_by_team_and_status(team, "COMPLETED")?
            .ok_or_else(|| ScanSageError::NotFound(format!("no completed scans for team {}", team)))?;
        let latest = self
            .latest_scan_by_team(team)?
            .ok_or_else(|| ScanSageError::NotFound(format!("no scans for team {}", team)))?;
        self.compare_scans(green.scan_id, latest.scan_id)
    }

    // --- knowledge entries -------------------------------------------------

    pub fn create_knowledge_entry(
        &self,
        question: &str,
        answer: &str,
        team: Option<&str>,
        created_by: Option<&str>,
    ) -> Result<KnowledgeEntry> {
        let entry = KnowledgeEntry {
            kb_id: Uuid::new_v4(),
            question: question.to_string(),
            answer: answer.to_string(),
            team: team.map(|t| t.to_string()),
            created_by: created_by.map(|c| c.to_string()),
            usage_count: 0,
            is_active: true,
        };
        let now = Utc::now().to_rfc3339();
        let db = self.lock()?;
        db.execute(
            "INSERT INTO knowledge_entries (kb_id, question, answer, team, created_by, usage_count, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 1, ?6, ?6)",
            params![
                entry.kb_id.to_string(),
                entry.question,
                entry.answer,
                entry.team,
                entry.created_by,
                now,
            ],
        )?;
        Ok(entry)
    }

    pub fn update_knowledge_entry(&self, kb_id: Uuid, question: &str, answer: &str) -> Result<()> {
        let db = self.lock()?;
        let updated = db.execute(
            "UPDATE knowledge_entries SET question = ?1, answer = ?2, updated_at = ?3 WHERE kb_id = ?4",
            params![question, answer, Utc::now().to_rfc3339(), kb_id.to_string()],
        )?;
        if updated == 0 {
            return Err(ScanSageError::NotFound(format!("knowledge entry {}", kb_id)));
        }
        Ok(())
    }

    pub fn delete_knowledge_entry(&self, kb_id: Uuid) -> Result<()> {
        let db = self.lock()?;
        let deleted = db.execute(
            "DELETE FROM knowledge_entries WHERE kb_id = ?1",
            params![kb_id.to_string()],
        )?;
        if deleted == 0 {
            return Err(ScanSageError::NotFound(format!("knowledge entry {}", kb_id)));
        }
        Ok(())
    }

    pub fn knowledge_entry(&self, kb_id: Uuid) -> Result<Option<KnowledgeEntry>> {
        let db = self.lock()?;
        let entry = db
            .query_row(
                "SELECT kb_id, question, answer, team, created_by, usage_count, is_active
                 FROM knowledge_entries WHERE kb_id = ?1",
                params![kb_id.to_string()],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// Active entries visible to a team: entries with no team label apply to
    /// everyone.
    pub fn active_knowledge_entries(&self, team: Option<&str>) -> Result<Vec<KnowledgeEntry>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT kb_id, question, answer, team, created_by, usage_count, is_active
             FROM knowledge_entries
             WHERE is_active = 1 AND (team IS NULL OR ?1 IS NULL OR team = ?1)",
        )?;
        let entries = stmt
            .query_map(params![team], row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Atomic usage increment: single UPDATE so concurrent identical queries
    /// cannot lose counts.
    pub fn increment_usage(&self, kb_id: Uuid) -> Result<()> {
        let db = self.lock()?;
        db.execute(
            "UPDATE knowledge_entries SET usage_count = usage_count + 1, updated_at = ?1 WHERE kb_id = ?2",
            params![Utc::now().to_rfc3339(), kb_id.to_string()],
        )?;
        Ok(())
    }
}

fn parse_uuid(text: String) -> std::result::Result<Uuid, rusqlite::Error> {
    Uuid::parse_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_timestamp(text: String) -> std::result::Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_scan(row: &Row<'_>) -> std::result::Result<Scan, rusqlite::Error> {
    Ok(Scan {
        scan_id: parse_uuid(row.get::<_, String>(0)?)?,
        workflow_id: row.get(1)?,
        run_id: row.get(2)?,
        team: row.get(3)?,
        project: row.get(4)?,
        scan_type: row.get(5)?,
        status: row.get(6)?,
        started_at: parse_timestamp(row.get::<_, String>(7)?)?,
        completed_at: row
            .get::<_, Option<String>>(8)?
            .map(parse_timestamp)
            .transpose()?,
    })
}

fn row_to_finding(row: &Row<'_>) -> std::result::Result<Finding, rusqlite::Error> {
    Ok(Finding {
        finding_id: parse_uuid(row.get::<_, String>(0)?)?,
        scan_id: parse_uuid(row.get::<_, String>(1)?)?,
        cwe_id: row.get(2)?,
        severity: row.get(3)?,
        title: row.get(4)?,
        description: row.get(5)?,
    })
}

fn row_to_entry(row: &Row<'_>) -> std::result::Result<KnowledgeEntry, rusqlite::Error> {
    Ok(KnowledgeEntry {
        kb_id: parse_uuid(row.get::<_, String>(0)?)?,
        question: row.get(1)?,
        answer: row.get(2)?,
        team: row.get(3)?,
        created_by: row.get(4)?,
        usage_count: row.get(5)?,
        is_active: row.get::<_, i64>(6)? != 0,
    })
}
