//! Transactional metadata repository for objects and publishes.
//!
//! URI uniqueness is enforced by the unique primary key on the derived
//! object id (`identity/uri`); a duplicate-key failure surfaces as
//! [`RepoError::UriNotUnique`]. Changing a URI is a delete-then-insert under
//! the new derived id inside the same transaction, so the constraint stays
//! authoritative.

use std::time::SystemTime;

use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    unix_now, Object, ObjectHandle, ObjectWithPublish, Publish, PublishId, PublishStatus,
};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("not found")]
    NotFound,
    #[error("uri is not unique")]
    UriNotUnique,
    #[error("invalid stored row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type RepoResult<T> = Result<T, RepoError>;

#[derive(Debug, FromRow)]
struct ObjectRow {
    id: String,
    identity: String,
    space_id: String,
    object_id: String,
    uri: String,
    created_at: i64,
    active_publish_id: Option<String>,
}

impl ObjectRow {
    fn into_object(self) -> RepoResult<Object> {
        let active_publish_id = self
            .active_publish_id
            .map(|id| {
                id.parse::<PublishId>()
                    .map_err(|_| RepoError::Corrupt(format!("bad publish id {id}")))
            })
            .transpose()?;
        Ok(Object {
            id: self.id,
            identity: self.identity,
            space_id: self.space_id,
            object_id: self.object_id,
            uri: self.uri,
            created_at: self.created_at,
            active_publish_id,
        })
    }
}

#[derive(Debug, FromRow)]
struct PublishRow {
    id: String,
    object_id: String,
    status: i64,
    version: String,
    upload_key: String,
    size: i64,
}

impl PublishRow {
    fn into_publish(self) -> RepoResult<Publish> {
        let id = self
            .id
            .parse::<PublishId>()
            .map_err(|_| RepoError::Corrupt(format!("bad publish id {}", self.id)))?;
        let status = PublishStatus::try_from(self.status)
            .map_err(|s| RepoError::Corrupt(format!("bad publish status {s}")))?;
        Ok(Publish {
            id,
            object_id: self.object_id,
            status,
            version: self.version,
            upload_key: self.upload_key,
            size: self.size,
        })
    }
}

const SELECT_OBJECT: &str =
    "SELECT id, identity, space_id, object_id, uri, created_at, active_publish_id FROM objects";
const SELECT_PUBLISH: &str =
    "SELECT id, object_id, status, version, upload_key, size FROM publishes";

#[derive(Debug, Clone)]
pub struct PublishRepo {
    pool: SqlitePool,
}

impl PublishRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Reserves a URI for the handle, or re-reserves under an existing object.
    ///
    /// Locates the object by (identity, space, inner object). Inserts it when
    /// absent; swaps the derived id when the URI changed; either way a fresh
    /// `Created` publish with a new upload key is attached. Returns the prior
    /// URI when it changed so the caller can invalidate downstream caches.
    pub async fn reserve_or_update(
        &self,
        handle: &ObjectHandle,
        version: &str,
    ) -> RepoResult<(ObjectWithPublish, Option<String>)> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, ObjectRow>(&format!(
            "{SELECT_OBJECT} WHERE identity = ? AND space_id = ? AND object_id = ?"
        ))
        .bind(&handle.identity)
        .bind(&handle.space_id)
        .bind(&handle.object_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (object, prev_uri) = match existing {
            Some(row) => {
                let mut object = row.into_object()?;
                if object.uri != handle.uri {
                    let prev = std::mem::replace(&mut object.uri, handle.uri.clone());
                    sqlx::query("DELETE FROM objects WHERE id = ?")
                        .bind(&object.id)
                        .execute(&mut *tx)
                        .await?;
                    object.id = Object::derived_id(&object.identity, &object.uri);
                    insert_object(&mut tx, &object).await?;
                    (object, Some(prev))
                } else {
                    (object, None)
                }
            }
            None => {
                let object = Object {
                    id: Object::derived_id(&handle.identity, &handle.uri),
                    identity: handle.identity.clone(),
                    space_id: handle.space_id.clone(),
                    object_id: handle.object_id.clone(),
                    uri: handle.uri.clone(),
                    created_at: unix_now(),
                    active_publish_id: None,
                };
                insert_object(&mut tx, &object).await?;
                (object, None)
            }
        };

        let publish = Publish {
            id: PublishId::new(),
            object_id: object.id.clone(),
            status: PublishStatus::Created,
            version: version.to_string(),
            upload_key: Uuid::new_v4().to_string(),
            size: 0,
        };
        sqlx::query(
            "INSERT INTO publishes (id, object_id, status, version, upload_key, size)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(publish.id.to_string())
        .bind(&publish.object_id)
        .bind(publish.status.as_i64())
        .bind(&publish.version)
        .bind(&publish.upload_key)
        .bind(publish.size)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((
            ObjectWithPublish {
                object,
                publish: Some(publish),
            },
            prev_uri,
        ))
    }

    /// Commits an upload: tombstones the previously active publish, stores
    /// the new status and size, burns the upload key and flips the object's
    /// active pointer. All writes land atomically.
    pub async fn finalize_publish(&self, owp: &ObjectWithPublish) -> RepoResult<()> {
        let publish = owp
            .publish
            .as_ref()
            .ok_or_else(|| RepoError::Corrupt("finalize without publish".into()))?;
        let mut tx = self.pool.begin().await?;

        if let Some(prev) = owp.object.active_publish_id {
            mark_ready_to_delete(&mut tx, prev).await?;
        }
        sqlx::query("UPDATE publishes SET status = ?, size = ?, upload_key = '' WHERE id = ?")
            .bind(publish.status.as_i64())
            .bind(publish.size)
            .bind(publish.id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE objects SET active_publish_id = ?, updated_at = ? WHERE id = ?")
            .bind(publish.id.to_string())
            .bind(unix_now())
            .bind(&owp.object.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Removes the object and tombstones its active publish, if any.
    /// Returns the URI it was bound to.
    pub async fn delete_object(
        &self,
        identity: &str,
        space_id: &str,
        object_id: &str,
    ) -> RepoResult<String> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, ObjectRow>(&format!(
            "{SELECT_OBJECT} WHERE identity = ? AND space_id = ? AND object_id = ?"
        ))
        .bind(identity)
        .bind(space_id)
        .bind(object_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(RepoError::NotFound)?;
        let object = row.into_object()?;

        sqlx::query("DELETE FROM objects WHERE id = ?")
            .bind(&object.id)
            .execute(&mut *tx)
            .await?;
        if let Some(active) = object.active_publish_id {
            mark_ready_to_delete(&mut tx, active).await?;
        }

        tx.commit().await?;
        Ok(object.uri)
    }

    /// Looks an object up by its derived id, optionally hydrating the active
    /// publish. A publish missing under a GC race clears the pointer in the
    /// returned value only; the repair is not persisted.
    pub async fn resolve_by_derived_id(
        &self,
        identity: &str,
        uri: &str,
        with_publish: bool,
    ) -> RepoResult<ObjectWithPublish> {
        let row = sqlx::query_as::<_, ObjectRow>(&format!("{SELECT_OBJECT} WHERE id = ?"))
            .bind(Object::derived_id(identity, uri))
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RepoError::NotFound)?;
        let object = row.into_object()?;
        self.hydrate(object, with_publish).await
    }

    /// Publication state of an object addressed by its owner handle.
    pub async fn publish_status(
        &self,
        identity: &str,
        space_id: &str,
        object_id: &str,
    ) -> RepoResult<ObjectWithPublish> {
        let row = sqlx::query_as::<_, ObjectRow>(&format!(
            "{SELECT_OBJECT} WHERE identity = ? AND space_id = ? AND object_id = ?"
        ))
        .bind(identity)
        .bind(space_id)
        .bind(object_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(RepoError::NotFound)?;
        let object = row.into_object()?;
        self.hydrate(object, true).await
    }

    /// All objects of an identity, optionally restricted to one space, with
    /// best-effort publish hydration.
    pub async fn list(
        &self,
        identity: &str,
        space_id: Option<&str>,
    ) -> RepoResult<Vec<ObjectWithPublish>> {
        let rows = match space_id {
            Some(space) => {
                sqlx::query_as::<_, ObjectRow>(&format!(
                    "{SELECT_OBJECT} WHERE identity = ? AND space_id = ?"
                ))
                .bind(identity)
                .bind(space)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ObjectRow>(&format!("{SELECT_OBJECT} WHERE identity = ?"))
                    .bind(identity)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let object = row.into_object()?;
            out.push(self.hydrate(object, true).await?);
        }
        Ok(out)
    }

    /// Reverse join from a publish id to its owning object; used by the
    /// upload endpoint to recover the reservation for a presented id.
    pub async fn get_publish(&self, id: PublishId) -> RepoResult<ObjectWithPublish> {
        let row = sqlx::query_as::<_, PublishRow>(&format!("{SELECT_PUBLISH} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RepoError::NotFound)?;
        let publish = row.into_publish()?;

        let object = sqlx::query_as::<_, ObjectRow>(&format!("{SELECT_OBJECT} WHERE id = ?"))
            .bind(&publish.object_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RepoError::NotFound)?
            .into_object()?;

        Ok(ObjectWithPublish {
            object,
            publish: Some(publish),
        })
    }

    /// Visits every publish marked ready-to-delete. An error from the
    /// visitor aborts the iteration.
    pub async fn iterate_ready_to_delete<F, Fut>(&self, mut f: F) -> anyhow::Result<()>
    where
        F: FnMut(PublishId) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM publishes WHERE status = ?")
            .bind(PublishStatus::ReadyToDelete.as_i64())
            .fetch_all(&self.pool)
            .await?;
        for id in ids {
            let id = id
                .parse::<PublishId>()
                .map_err(|_| RepoError::Corrupt(format!("bad publish id {id}")))?;
            f(id).await?;
        }
        Ok(())
    }

    /// Unconditional removal of one publish record.
    pub async fn delete_publish(&self, id: PublishId) -> RepoResult<()> {
        sqlx::query("DELETE FROM publishes WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Reaps abandoned reservations: `Created` publishes whose id-embedded
    /// timestamp is older than `before`. Returns the number removed.
    pub async fn delete_outdated_publishes(&self, before: SystemTime) -> RepoResult<u64> {
        let result = sqlx::query("DELETE FROM publishes WHERE status = ? AND id < ?")
            .bind(PublishStatus::Created.as_i64())
            .bind(PublishId::floor(before).to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Removes objects that never acquired an active publish and were
    /// reserved before `before`. Returns the number removed.
    pub async fn delete_outdated_objects(&self, before: SystemTime) -> RepoResult<u64> {
        let before_secs = before
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let result =
            sqlx::query("DELETE FROM objects WHERE active_publish_id IS NULL AND created_at < ?")
                .bind(before_secs)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn hydrate(&self, mut object: Object, with_publish: bool) -> RepoResult<ObjectWithPublish> {
        let mut publish = None;
        if with_publish {
            if let Some(active) = object.active_publish_id {
                let row =
                    sqlx::query_as::<_, PublishRow>(&format!("{SELECT_PUBLISH} WHERE id = ?"))
                        .bind(active.to_string())
                        .fetch_optional(&self.pool)
                        .await?;
                match row {
                    Some(row) => publish = Some(row.into_publish()?),
                    // lost a race against GC; report the object as unpublished
                    None => object.active_publish_id = None,
                }
            }
        }
        Ok(ObjectWithPublish { object, publish })
    }
}

async fn insert_object(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    object: &Object,
) -> RepoResult<()> {
    let result = sqlx::query(
        "INSERT INTO objects (id, identity, space_id, object_id, uri, created_at, active_publish_id)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&object.id)
    .bind(&object.identity)
    .bind(&object.space_id)
    .bind(&object.object_id)
    .bind(&object.uri)
    .bind(object.created_at)
    .bind(object.active_publish_id.map(|id| id.to_string()))
    .execute(&mut **tx)
    .await;
    match result {
        Ok(_) => Ok(()),
        Err(err) if is_unique_violation(&err) => Err(RepoError::UriNotUnique),
        Err(err) => Err(err.into()),
    }
}

async fn mark_ready_to_delete(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    id: PublishId,
) -> RepoResult<()> {
    sqlx::query("UPDATE publishes SET status = ? WHERE id = ?")
        .bind(PublishStatus::ReadyToDelete.as_i64())
        .bind(id.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
