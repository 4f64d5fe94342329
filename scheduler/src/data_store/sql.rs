// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// SQLite-backed DataStore (spec.md §4.4 `sql` backend). Adopted from
// `paritytech-substrate-archive`'s sqlx/async pairing, substituted from its
// Postgres/async-std stack to SQLite/tokio to match this workspace's
// runtime (see DESIGN.md). Uses the runtime-checked `sqlx::query` builder
// rather than the `query!` macro so no live database is required at
// compile time.

use async_trait::async_trait;
use buildgrid_grpc_util::{ComponentError, ErrorKind};
use buildgrid_hashing::{Digest, Fingerprint};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use super::{stage_from_i32, stage_to_i32, FieldChange, JobFilter, JobRecord};
use crate::job::LeaseState;

fn sql_err(err: sqlx::Error) -> ComponentError {
    ComponentError::new(ErrorKind::BackendUnavailable, err.to_string())
}

pub struct SqlDataStore {
    pool: SqlitePool,
}

impl SqlDataStore {
    pub async fn connect(url: &str) -> Result<SqlDataStore, ComponentError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(sql_err)?;
        sqlx::migrate!("./migrations").run(&pool).await.map_err(|err| {
            ComponentError::new(ErrorKind::BackendUnavailable, err.to_string())
        })?;
        Ok(SqlDataStore { pool })
    }
}

#[async_trait]
impl super::DataStore for SqlDataStore {
    async fn create_job(&self, record: JobRecord) -> Result<(), ComponentError> {
        sqlx::query(
            "INSERT INTO jobs (name, action_digest_hash, action_digest_size, priority, stage, \
             do_not_cache, n_tries, queued_timestamp, cancelled) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.name)
        .bind(record.action_digest.hash.to_hex())
        .bind(record.action_digest.size_bytes as i64)
        .bind(record.priority)
        .bind(stage_to_i32(record.stage))
        .bind(record.do_not_cache)
        .bind(record.n_tries as i64)
        .bind(record.queued_timestamp_unix_nanos)
        .bind(record.cancelled)
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;
        Ok(())
    }

    async fn update_job(&self, name: &str, changes: &[FieldChange]) -> Result<(), ComponentError> {
        for change in changes {
            match change {
                FieldChange::Stage(stage) => {
                    sqlx::query("UPDATE jobs SET stage = ? WHERE name = ?")
                        .bind(stage_to_i32(*stage))
                        .bind(name)
                        .execute(&self.pool)
                        .await
                        .map_err(sql_err)?;
                }
                FieldChange::Priority(priority) => {
                    sqlx::query("UPDATE jobs SET priority = ? WHERE name = ?")
                        .bind(priority)
                        .bind(name)
                        .execute(&self.pool)
                        .await
                        .map_err(sql_err)?;
                }
                FieldChange::QueuedTimestamp(nanos) => {
                    sqlx::query("UPDATE jobs SET queued_timestamp = ? WHERE name = ?")
                        .bind(nanos)
                        .bind(name)
                        .execute(&self.pool)
                        .await
                        .map_err(sql_err)?;
                }
                FieldChange::NTries(n) => {
                    sqlx::query("UPDATE jobs SET n_tries = ? WHERE name = ?")
                        .bind(*n as i64)
                        .bind(name)
                        .execute(&self.pool)
                        .await
                        .map_err(sql_err)?;
                }
                FieldChange::Cancelled(cancelled) => {
                    sqlx::query("UPDATE jobs SET cancelled = ? WHERE name = ?")
                        .bind(cancelled)
                        .bind(name)
                        .execute(&self.pool)
                        .await
                        .map_err(sql_err)?;
                }
                FieldChange::DoNotCache(do_not_cache) => {
                    sqlx::query("UPDATE jobs SET do_not_cache = ? WHERE name = ?")
                        .bind(do_not_cache)
                        .bind(name)
                        .execute(&self.pool)
                        .await
                        .map_err(sql_err)?;
                }
            }
        }
        Ok(())
    }

    async fn delete_job(&self, name: &str) -> Result<(), ComponentError> {
        sqlx::query("DELETE FROM leases WHERE job_name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        sqlx::query("DELETE FROM operations WHERE job_name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        sqlx::query("DELETE FROM jobs WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(())
    }

    async fn create_operation(&self, operation_name: &str, job_name: &str) -> Result<(), ComponentError> {
        sqlx::query("INSERT INTO operations (name, job_name) VALUES (?, ?)")
            .bind(operation_name)
            .bind(job_name)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(())
    }

    async fn create_lease(&self, job_name: &str, lease_id: &str) -> Result<(), ComponentError> {
        sqlx::query(
            "INSERT INTO leases (job_name, lease_id, state, status_code) VALUES (?, ?, 1, NULL)",
        )
        .bind(job_name)
        .bind(lease_id)
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;
        Ok(())
    }

    async fn update_lease(
        &self,
        job_name: &str,
        state: LeaseState,
        status_code: Option<i32>,
    ) -> Result<(), ComponentError> {
        sqlx::query("UPDATE leases SET state = ?, status_code = ? WHERE job_name = ?")
            .bind(super::lease_state_to_i32(state))
            .bind(status_code)
            .bind(job_name)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(())
    }

    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<JobRecord>, ComponentError> {
        let rows = if let Some(stage) = filter.stage {
            sqlx::query("SELECT * FROM jobs WHERE stage = ?")
                .bind(stage_to_i32(stage))
                .fetch_all(&self.pool)
                .await
        } else {
            sqlx::query("SELECT * FROM jobs").fetch_all(&self.pool).await
        }
        .map_err(sql_err)?;

        rows.into_iter()
            .map(|row| {
                let hash: String = row.try_get("action_digest_hash").map_err(sql_err)?;
                let size: i64 = row.try_get("action_digest_size").map_err(sql_err)?;
                let fingerprint = Fingerprint::from_hex_string(&hash)
                    .map_err(ComponentError::invalid_argument)?;
                Ok(JobRecord {
                    name: row.try_get("name").map_err(sql_err)?,
                    action_digest: Digest::new(fingerprint, size as usize),
                    priority: row.try_get("priority").map_err(sql_err)?,
                    stage: stage_from_i32(row.try_get("stage").map_err(sql_err)?),
                    do_not_cache: row.try_get("do_not_cache").map_err(sql_err)?,
                    n_tries: row.try_get::<i64, _>("n_tries").map_err(sql_err)? as u32,
                    queued_timestamp_unix_nanos: row.try_get("queued_timestamp").map_err(sql_err)?,
                    cancelled: row.try_get("cancelled").map_err(sql_err)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_store::DataStore;
    use crate::job::ExecuteStage;

    async fn store() -> SqlDataStore {
        SqlDataStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn create_and_list_round_trips_a_job() {
        let store = store().await;
        let record = JobRecord {
            name: "job-1".into(),
            action_digest: Digest::of_bytes(b"action"),
            priority: 3,
            stage: ExecuteStage::Queued,
            do_not_cache: false,
            n_tries: 0,
            queued_timestamp_unix_nanos: Some(42),
            cancelled: false,
        };
        store.create_job(record.clone()).await.unwrap();

        let jobs = store.list_jobs(JobFilter::default()).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "job-1");
        assert_eq!(jobs[0].action_digest, record.action_digest);
    }

    #[tokio::test]
    async fn update_job_changes_stage() {
        let store = store().await;
        store
            .create_job(JobRecord {
                name: "job-1".into(),
                action_digest: Digest::of_bytes(b"action"),
                priority: 0,
                stage: ExecuteStage::Queued,
                do_not_cache: false,
                n_tries: 0,
                queued_timestamp_unix_nanos: None,
                cancelled: false,
            })
            .await
            .unwrap();

        store
            .update_job("job-1", &[FieldChange::Stage(ExecuteStage::Executing)])
            .await
            .unwrap();

        let jobs = store.list_jobs(JobFilter::default()).await.unwrap();
        assert_eq!(jobs[0].stage, ExecuteStage::Executing);
    }
}
