use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::Utc;
use tokio_rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use crate::types::{Agent, AgentRole, AgentStatus, Bead, BeadStatus, ProviderConfig};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("bead not found: {0}")]
    BeadNotFound(Uuid),
    #[error("dependency cycle: {bead} -> {depends_on}")]
    DependencyCycle { bead: Uuid, depends_on: Uuid },
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// helpers – enum <-> SQLite string
// ---------------------------------------------------------------------------

fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

/// Async SQLite-backed store for beads, dependencies, agents, and providers.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        debug!(path = %path.as_ref().display(), "store opened");
        Ok(store)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS beads (
                        id          TEXT PRIMARY KEY,
                        title       TEXT NOT NULL,
                        description TEXT,
                        status      TEXT NOT NULL,
                        priority    TEXT NOT NULL,
                        bead_type   TEXT NOT NULL,
                        project_id  TEXT NOT NULL,
                        assignee    TEXT,
                        context     TEXT NOT NULL,
                        created_at  TEXT NOT NULL,
                        updated_at  TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_beads_status  ON beads(status);
                    CREATE INDEX IF NOT EXISTS idx_beads_project ON beads(project_id);
                    CREATE INDEX IF NOT EXISTS idx_beads_title   ON beads(title);

                    CREATE TABLE IF NOT EXISTS bead_dependencies (
                        bead_id            TEXT NOT NULL,
                        depends_on_bead_id TEXT NOT NULL,
                        position           INTEGER NOT NULL,
                        PRIMARY KEY (bead_id, depends_on_bead_id)
                    );

                    CREATE TABLE IF NOT EXISTS agents (
                        id             TEXT PRIMARY KEY,
                        name           TEXT NOT NULL UNIQUE,
                        role           TEXT NOT NULL,
                        persona        TEXT,
                        status         TEXT NOT NULL,
                        project_id     TEXT NOT NULL,
                        last_heartbeat TEXT NOT NULL,
                        current_bead   TEXT,
                        last_activity  TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status);

                    CREATE TABLE IF NOT EXISTS providers (
                        id                     TEXT PRIMARY KEY,
                        provider_type          TEXT NOT NULL,
                        endpoint               TEXT NOT NULL,
                        api_key                TEXT,
                        model                  TEXT NOT NULL,
                        status                 TEXT NOT NULL,
                        last_heartbeat_at      TEXT,
                        heartbeat_latency_ms   REAL NOT NULL DEFAULT 0,
                        avg_request_latency_ms REAL NOT NULL DEFAULT 0,
                        total_requests         INTEGER NOT NULL DEFAULT 0,
                        successful_requests    INTEGER NOT NULL DEFAULT 0,
                        model_size_b           REAL NOT NULL DEFAULT 0,
                        cost_per_mtok          REAL NOT NULL DEFAULT 0,
                        context_window         INTEGER NOT NULL DEFAULT 0,
                        score                  REAL NOT NULL DEFAULT 0
                    );
                    ",
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::Db)
    }

    // -----------------------------------------------------------------------
    // Bead CRUD
    // -----------------------------------------------------------------------

    /// Insert or update a bead, replacing its dependency rows.
    ///
    /// Rejects writes whose dependency list would introduce a cycle in the
    /// bead dependency graph.
    pub async fn upsert_bead(&self, bead: &Bead) -> Result<()> {
        if !bead.depends_on.is_empty() {
            self.check_no_cycle(bead.id, &bead.depends_on).await?;
        }

        let id = bead.id.to_string();
        let title = bead.title.clone();
        let description = bead.description.clone();
        let status = enum_to_sql(&bead.status);
        let priority = enum_to_sql(&bead.priority);
        let bead_type = enum_to_sql(&bead.bead_type);
        let project_id = bead.project_id.clone();
        let assignee = bead.assignee.map(|u| u.to_string());
        let context = serde_json::to_string(&bead.context).expect("serialize context");
        let created_at = bead.created_at.to_rfc3339();
        let updated_at = bead.updated_at.to_rfc3339();
        let deps: Vec<String> = bead.depends_on.iter().map(|u| u.to_string()).collect();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO beads (id, title, description, status, priority, bead_type,
                        project_id, assignee, context, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
                     ON CONFLICT(id) DO UPDATE SET
                        title=excluded.title, description=excluded.description,
                        status=excluded.status, priority=excluded.priority,
                        bead_type=excluded.bead_type, project_id=excluded.project_id,
                        assignee=excluded.assignee, context=excluded.context,
                        updated_at=excluded.updated_at",
                    rusqlite::params![
                        id, title, description, status, priority, bead_type, project_id,
                        assignee, context, created_at, updated_at,
                    ],
                )?;
                tx.execute(
                    "DELETE FROM bead_dependencies WHERE bead_id = ?1",
                    rusqlite::params![id],
                )?;
                for (pos, dep) in deps.iter().enumerate() {
                    tx.execute(
                        "INSERT INTO bead_dependencies (bead_id, depends_on_bead_id, position)
                         VALUES (?1, ?2, ?3)",
                        rusqlite::params![id, dep, pos as i64],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(StoreError::Db)
    }

    /// Create a new bead and return its id.
    pub async fn create_bead(&self, bead: &Bead) -> Result<Uuid> {
        self.upsert_bead(bead).await?;
        Ok(bead.id)
    }

    pub async fn get_bead(&self, id: Uuid) -> Result<Option<Bead>> {
        let id_str = id.to_string();
        let bead = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, title, description, status, priority, bead_type,
                            project_id, assignee, context, created_at, updated_at
                     FROM beads WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                let bead = match rows.next()? {
                    Some(row) => Some(row_to_bead(row)?),
                    None => None,
                };
                let Some(mut bead) = bead else {
                    return Ok(None);
                };
                bead.depends_on = load_dependencies(conn, bead.id)?;
                Ok(Some(bead))
            })
            .await?;
        Ok(bead)
    }

    /// Fetch a bead that must exist.
    pub async fn require_bead(&self, id: Uuid) -> Result<Bead> {
        self.get_bead(id).await?.ok_or(StoreError::BeadNotFound(id))
    }

    pub async fn list_beads_by_status(&self, status: BeadStatus) -> Result<Vec<Bead>> {
        let status_str = enum_to_sql(&status);
        let beads = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, title, description, status, priority, bead_type,
                            project_id, assignee, context, created_at, updated_at
                     FROM beads WHERE status = ?1 ORDER BY created_at ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![status_str])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_bead(row)?);
                }
                for bead in &mut out {
                    bead.depends_on = load_dependencies(conn, bead.id)?;
                }
                Ok(out)
            })
            .await?;
        Ok(beads)
    }

    /// Beads the dispatcher scans each pass: open plus in_progress for the
    /// given project, oldest first.
    pub async fn list_dispatchable(&self, project_id: &str) -> Result<Vec<Bead>> {
        let project = project_id.to_string();
        let beads = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, title, description, status, priority, bead_type,
                            project_id, assignee, context, created_at, updated_at
                     FROM beads
                     WHERE project_id = ?1 AND status IN ('open', 'in_progress')
                     ORDER BY created_at ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![project])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_bead(row)?);
                }
                for bead in &mut out {
                    bead.depends_on = load_dependencies(conn, bead.id)?;
                }
                Ok(out)
            })
            .await?;
        Ok(beads)
    }

    /// Find a non-terminal bead with the given exact title (audit dedup).
    pub async fn find_active_bead_by_title(&self, title: &str) -> Result<Option<Bead>> {
        let title = title.to_string();
        let bead = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, title, description, status, priority, bead_type,
                            project_id, assignee, context, created_at, updated_at
                     FROM beads
                     WHERE title = ?1 AND status IN ('open', 'in_progress')
                     LIMIT 1",
                )?;
                let mut rows = stmt.query(rusqlite::params![title])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_bead(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(bead)
    }

    /// Add one dependency edge, rejecting cycles.
    pub async fn add_dependency(&self, bead_id: Uuid, depends_on: Uuid) -> Result<()> {
        let mut bead = self.require_bead(bead_id).await?;
        if bead.depends_on.contains(&depends_on) {
            return Ok(());
        }
        bead.depends_on.push(depends_on);
        bead.updated_at = Utc::now();
        self.upsert_bead(&bead).await
    }

    /// Walk the dependency graph from each proposed dependency; if any path
    /// leads back to `bead_id` the write would create a cycle.
    async fn check_no_cycle(&self, bead_id: Uuid, proposed: &[Uuid]) -> Result<()> {
        let proposed: Vec<String> = proposed.iter().map(|u| u.to_string()).collect();
        let bead_str = bead_id.to_string();
        let offender = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare("SELECT bead_id, depends_on_bead_id FROM bead_dependencies")?;
                let mut rows = stmt.query([])?;
                let mut graph: HashMap<String, Vec<String>> = HashMap::new();
                while let Some(row) = rows.next()? {
                    let from: String = row.get(0)?;
                    let to: String = row.get(1)?;
                    graph.entry(from).or_default().push(to);
                }
                // The write replaces bead's own edges with the proposed set.
                graph.insert(bead_str.clone(), proposed.clone());

                for dep in &proposed {
                    let mut seen: HashSet<String> = HashSet::new();
                    let mut stack = vec![dep.clone()];
                    while let Some(node) = stack.pop() {
                        if node == bead_str {
                            return Ok(Some(dep.clone()));
                        }
                        if !seen.insert(node.clone()) {
                            continue;
                        }
                        if let Some(next) = graph.get(&node) {
                            stack.extend(next.iter().cloned());
                        }
                    }
                }
                Ok(None)
            })
            .await?;

        match offender {
            Some(dep) => Err(StoreError::DependencyCycle {
                bead: bead_id,
                depends_on: Uuid::parse_str(&dep).expect("valid uuid"),
            }),
            None => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Agent CRUD
    // -----------------------------------------------------------------------

    pub async fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        let id = agent.id.to_string();
        let name = agent.name.clone();
        let role = enum_to_sql(&agent.role);
        let persona = agent.persona.clone();
        let status = enum_to_sql(&agent.status);
        let project_id = agent.project_id.clone();
        let last_heartbeat = agent.last_heartbeat.to_rfc3339();
        let current_bead = agent.current_bead.map(|u| u.to_string());
        let last_activity = agent.last_activity.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agents (id, name, role, persona, status, project_id,
                        last_heartbeat, current_bead, last_activity)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
                     ON CONFLICT(id) DO UPDATE SET
                        name=excluded.name, role=excluded.role, persona=excluded.persona,
                        status=excluded.status, project_id=excluded.project_id,
                        last_heartbeat=excluded.last_heartbeat,
                        current_bead=excluded.current_bead,
                        last_activity=excluded.last_activity",
                    rusqlite::params![
                        id, name, role, persona, status, project_id, last_heartbeat,
                        current_bead, last_activity,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::Db)
    }

    pub async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>> {
        let id_str = id.to_string();
        let agent = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, role, persona, status, project_id,
                            last_heartbeat, current_bead, last_activity
                     FROM agents WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_agent(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(agent)
    }

    /// Enumerate agents, optionally filtered by project, role, and status.
    pub async fn list_agents(
        &self,
        project_id: Option<&str>,
        role: Option<AgentRole>,
        status: Option<AgentStatus>,
    ) -> Result<Vec<Agent>> {
        let project = project_id.map(|s| s.to_string());
        let role_str = role.map(|r| enum_to_sql(&r));
        let status_str = status.map(|s| enum_to_sql(&s));
        let agents = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, role, persona, status, project_id,
                            last_heartbeat, current_bead, last_activity
                     FROM agents ORDER BY last_activity ASC",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_agent(row)?);
                }
                Ok(out)
            })
            .await?;

        Ok(agents
            .into_iter()
            .filter(|a| project.as_deref().is_none_or(|p| a.project_id == p))
            .filter(|a| role_str.as_deref().is_none_or(|r| enum_to_sql(&a.role) == r))
            .filter(|a| status_str.as_deref().is_none_or(|s| enum_to_sql(&a.status) == s))
            .collect())
    }

    // -----------------------------------------------------------------------
    // Provider rows
    // -----------------------------------------------------------------------

    pub async fn upsert_provider(&self, provider: &ProviderConfig) -> Result<()> {
        let p = provider.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO providers (id, provider_type, endpoint, api_key, model, status,
                        last_heartbeat_at, heartbeat_latency_ms, avg_request_latency_ms,
                        total_requests, successful_requests, model_size_b, cost_per_mtok,
                        context_window, score)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)
                     ON CONFLICT(id) DO UPDATE SET
                        provider_type=excluded.provider_type, endpoint=excluded.endpoint,
                        api_key=excluded.api_key, model=excluded.model, status=excluded.status,
                        last_heartbeat_at=excluded.last_heartbeat_at,
                        heartbeat_latency_ms=excluded.heartbeat_latency_ms,
                        avg_request_latency_ms=excluded.avg_request_latency_ms,
                        total_requests=excluded.total_requests,
                        successful_requests=excluded.successful_requests,
                        model_size_b=excluded.model_size_b,
                        cost_per_mtok=excluded.cost_per_mtok,
                        context_window=excluded.context_window, score=excluded.score",
                    rusqlite::params![
                        p.id,
                        enum_to_sql(&p.provider_type),
                        p.endpoint,
                        p.api_key,
                        p.model,
                        enum_to_sql(&p.status),
                        p.last_heartbeat_at.map(|d| d.to_rfc3339()),
                        p.heartbeat_latency_ms,
                        p.avg_request_latency_ms,
                        p.total_requests as i64,
                        p.successful_requests as i64,
                        p.model_size_b,
                        p.cost_per_mtok,
                        p.context_window as i64,
                        p.score,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::Db)
    }

    pub async fn list_providers(&self) -> Result<Vec<ProviderConfig>> {
        let providers = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, provider_type, endpoint, api_key, model, status,
                            last_heartbeat_at, heartbeat_latency_ms, avg_request_latency_ms,
                            total_requests, successful_requests, model_size_b, cost_per_mtok,
                            context_window, score
                     FROM providers ORDER BY id ASC",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_provider(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(providers)
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn load_dependencies(
    conn: &rusqlite::Connection,
    bead_id: Uuid,
) -> rusqlite::Result<Vec<Uuid>> {
    let mut stmt = conn.prepare(
        "SELECT depends_on_bead_id FROM bead_dependencies
         WHERE bead_id = ?1 ORDER BY position ASC",
    )?;
    let mut rows = stmt.query(rusqlite::params![bead_id.to_string()])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let raw: String = row.get(0)?;
        out.push(Uuid::parse_str(&raw).expect("valid uuid"));
    }
    Ok(out)
}

fn row_to_bead(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bead> {
    let id_str: String = row.get(0)?;
    let status_str: String = row.get(3)?;
    let priority_str: String = row.get(4)?;
    let type_str: String = row.get(5)?;
    let assignee_str: Option<String> = row.get(7)?;
    let context_str: String = row.get(8)?;
    let created_at_str: String = row.get(9)?;
    let updated_at_str: String = row.get(10)?;

    Ok(Bead {
        id: Uuid::parse_str(&id_str).expect("valid uuid"),
        title: row.get(1)?,
        description: row.get(2)?,
        status: enum_from_sql(&status_str),
        priority: enum_from_sql(&priority_str),
        bead_type: enum_from_sql(&type_str),
        project_id: row.get(6)?,
        assignee: assignee_str.map(|s| Uuid::parse_str(&s).expect("valid uuid")),
        depends_on: Vec::new(),
        context: serde_json::from_str(&context_str).expect("valid json"),
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at_str)
            .expect("valid date")
            .with_timezone(&Utc),
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at_str)
            .expect("valid date")
            .with_timezone(&Utc),
    })
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    let id_str: String = row.get(0)?;
    let role_str: String = row.get(2)?;
    let status_str: String = row.get(4)?;
    let last_heartbeat_str: String = row.get(6)?;
    let current_bead_str: Option<String> = row.get(7)?;
    let last_activity_str: String = row.get(8)?;

    Ok(Agent {
        id: Uuid::parse_str(&id_str).expect("valid uuid"),
        name: row.get(1)?,
        role: enum_from_sql(&role_str),
        persona: row.get(3)?,
        status: enum_from_sql(&status_str),
        project_id: row.get(5)?,
        last_heartbeat: chrono::DateTime::parse_from_rfc3339(&last_heartbeat_str)
            .expect("valid date")
            .with_timezone(&Utc),
        current_bead: current_bead_str.map(|s| Uuid::parse_str(&s).expect("valid uuid")),
        last_activity: chrono::DateTime::parse_from_rfc3339(&last_activity_str)
            .expect("valid date")
            .with_timezone(&Utc),
    })
}

fn row_to_provider(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProviderConfig> {
    let type_str: String = row.get(1)?;
    let status_str: String = row.get(5)?;
    let heartbeat_str: Option<String> = row.get(6)?;
    let total: i64 = row.get(9)?;
    let successful: i64 = row.get(10)?;
    let context_window: i64 = row.get(13)?;

    Ok(ProviderConfig {
        id: row.get(0)?,
        provider_type: enum_from_sql(&type_str),
        endpoint: row.get(2)?,
        api_key: row.get(3)?,
        model: row.get(4)?,
        status: enum_from_sql(&status_str),
        last_heartbeat_at: heartbeat_str.map(|s| {
            chrono::DateTime::parse_from_rfc3339(&s)
                .expect("valid date")
                .with_timezone(&Utc)
        }),
        heartbeat_latency_ms: row.get(7)?,
        avg_request_latency_ms: row.get(8)?,
        total_requests: total as u64,
        successful_requests: successful as u64,
        model_size_b: row.get(11)?,
        cost_per_mtok: row.get(12)?,
        context_window: context_window as u32,
        score: row.get(14)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
