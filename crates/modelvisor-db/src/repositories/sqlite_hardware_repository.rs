//! `SQLite` implementation of the `HardwareRepository` trait.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use modelvisor_core::{DeviceKind, HardwareRecord, HardwareRepository, RepositoryError};

/// `SQLite` implementation of the `HardwareRepository` trait.
///
/// One row per physical device, keyed by its stable UUID.
pub struct SqliteHardwareRepository {
    pool: SqlitePool,
}

impl SqliteHardwareRepository {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_record(row: &SqliteRow) -> Result<HardwareRecord, RepositoryError> {
    let kind: String = row.get("type");
    Ok(HardwareRecord {
        uuid: row.get("uuid"),
        kind: kind.parse::<DeviceKind>().map_err(RepositoryError::Serialization)?,
        hardware_id: row.get("hardware_id"),
        software_id: row.get("software_id"),
        activated: row.get::<i64, _>("activated") != 0,
        priority: row.get("priority"),
    })
}

#[async_trait]
impl HardwareRepository for SqliteHardwareRepository {
    async fn list(&self) -> Result<Vec<HardwareRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT uuid, type, hardware_id, software_id, activated, priority \
             FROM hardware ORDER BY priority ASC, software_id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Storage(e.to_string()))?;

        rows.iter().map(row_to_record).collect()
    }

    async fn upsert(&self, record: &HardwareRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT OR REPLACE INTO hardware \
             (uuid, type, hardware_id, software_id, activated, priority) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.uuid)
        .bind(record.kind.as_str())
        .bind(record.hardware_id)
        .bind(record.software_id)
        .bind(i64::from(record.activated))
        .bind(record.priority)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn remove(&self, uuid: &str) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM hardware WHERE uuid = ?")
            .bind(uuid)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(uuid.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::setup_test_database;

    fn gpu(uuid: &str, software_id: i64, activated: bool, priority: i64) -> HardwareRecord {
        HardwareRecord {
            uuid: uuid.to_string(),
            kind: DeviceKind::Gpu,
            hardware_id: software_id,
            software_id,
            activated,
            priority,
        }
    }

    #[tokio::test]
    async fn test_list_orders_by_priority() {
        let pool = setup_test_database().await.unwrap();
        let repo = SqliteHardwareRepository::new(pool);

        repo.upsert(&gpu("GPU-b", 1, true, 0)).await.unwrap();
        repo.upsert(&gpu("GPU-a", 0, true, 1)).await.unwrap();

        let rows = repo.list().await.unwrap();
        let uuids: Vec<_> = rows.iter().map(|r| r.uuid.as_str()).collect();
        assert_eq!(uuids, vec!["GPU-b", "GPU-a"]);
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_uuid() {
        let pool = setup_test_database().await.unwrap();
        let repo = SqliteHardwareRepository::new(pool);

        repo.upsert(&gpu("GPU-a", 0, false, 0)).await.unwrap();
        let mut moved = gpu("GPU-a", 3, true, 0);
        moved.hardware_id = 2;
        repo.upsert(&moved).await.unwrap();

        let rows = repo.list().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], moved);
    }

    #[tokio::test]
    async fn test_remove_unknown_is_not_found() {
        let pool = setup_test_database().await.unwrap();
        let repo = SqliteHardwareRepository::new(pool);

        repo.upsert(&gpu("GPU-a", 0, false, 0)).await.unwrap();
        repo.remove("GPU-a").await.unwrap();
        assert!(matches!(
            repo.remove("GPU-a").await,
            Err(RepositoryError::NotFound(_))
        ));
    }
}
