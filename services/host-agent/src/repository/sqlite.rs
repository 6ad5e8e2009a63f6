//! SQLite-backed repository.
//!
//! One row per microVM with spec and status stored as JSON documents, so the
//! agent recovers every declared VM after a restart.

use std::path::Path;

use async_trait::async_trait;
use kiln_id::VmId;
use kiln_model::{MicroVm, MicroVmSpec, MicroVmStatus};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{check_spec_write, check_status_write, MicroVmRepository};
use crate::error::RepositoryError;

pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    /// Open or create a repository at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    pub fn open_in_memory() -> Result<Self, RepositoryError> {
        let repo = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    fn init_schema(&self) -> Result<(), RepositoryError> {
        self.conn.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS microvms (
                id TEXT PRIMARY KEY,
                namespace TEXT NOT NULL,
                name TEXT NOT NULL,
                generation INTEGER NOT NULL,
                spec TEXT NOT NULL,
                status TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_microvms_namespace ON microvms(namespace);
            "#,
        )?;

        debug!("MicroVM repository schema initialized");
        Ok(())
    }

    fn load(&self, id: &VmId) -> Result<Option<MicroVm>, RepositoryError> {
        let conn = self.conn.lock();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT spec, status FROM microvms WHERE id = ?1",
                params![id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        row.map(|(spec, status)| -> Result<MicroVm, RepositoryError> {
            Ok(MicroVm {
                id: id.clone(),
                spec: serde_json::from_str(&spec)?,
                status: serde_json::from_str(&status)?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl MicroVmRepository for SqliteRepository {
    async fn get(&self, id: &VmId) -> Result<Option<MicroVm>, RepositoryError> {
        self.load(id)
    }

    async fn save_spec(&self, id: &VmId, spec: &MicroVmSpec) -> Result<(), RepositoryError> {
        let spec_json = serde_json::to_string(spec)?;
        let now = chrono::Utc::now().timestamp();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let stored: Option<i64> = tx
            .query_row(
                "SELECT generation FROM microvms WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        match stored {
            Some(stored) => {
                check_spec_write(id, stored as u64, spec.generation)?;
                tx.execute(
                    "UPDATE microvms SET spec = ?1, generation = ?2, updated_at = ?3 WHERE id = ?4",
                    params![spec_json, spec.generation as i64, now, id.to_string()],
                )?;
            }
            None => {
                let status_json = serde_json::to_string(&MicroVmStatus::default())?;
                tx.execute(
                    r#"
                    INSERT INTO microvms (id, namespace, name, generation, spec, status, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#,
                    params![
                        id.to_string(),
                        id.namespace(),
                        id.name(),
                        spec.generation as i64,
                        spec_json,
                        status_json,
                        now,
                    ],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    async fn save_status(&self, id: &VmId, status: &MicroVmStatus) -> Result<(), RepositoryError> {
        let status_json = serde_json::to_string(status)?;
        let now = chrono::Utc::now().timestamp();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let spec_json: Option<String> = tx
            .query_row(
                "SELECT spec FROM microvms WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(spec_json) = spec_json else {
            return Err(RepositoryError::NotFound(id.clone()));
        };
        let spec: MicroVmSpec = serde_json::from_str(&spec_json)?;
        check_status_write(&spec, status)?;

        tx.execute(
            "UPDATE microvms SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status_json, now, id.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn delete(&self, id: &VmId) -> Result<bool, RepositoryError> {
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM microvms WHERE id = ?1", params![id.to_string()])?;
        Ok(removed > 0)
    }

    async fn list_ids(&self) -> Result<Vec<VmId>, RepositoryError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM microvms ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        ids.iter()
            .map(|s| VmId::parse(s).map_err(RepositoryError::from))
            .collect()
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<MicroVm>, RepositoryError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, spec, status FROM microvms
             WHERE ?1 IS NULL OR namespace = ?1
             ORDER BY id",
        )?;

        let rows = stmt
            .query_map(params![namespace], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, spec, status)| -> Result<MicroVm, RepositoryError> {
                Ok(MicroVm {
                    id: VmId::parse(&id)?,
                    spec: serde_json::from_str(&spec)?,
                    status: serde_json::from_str(&status)?,
                })
            })
            .collect()
    }
}
