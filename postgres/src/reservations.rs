//! Reservation store.
//!
//! The reservation row and its provider detail row are created in one transaction. Every
//! statement filters by `account_id`, so another tenant's reservation behaves like a
//! missing one.

use crate::store_error;
use provisioning_core::reservation::{
    AccountId, AwsReservationDetail, AzureReservationDetail, GcpReservationDetail, Instance,
    InstanceDetail, NewReservation, ProviderType, Reservation, ReservationDetail, ReservationId,
    STATUS_CREATED, StatusUpdate,
};
use provisioning_core::store::{ReservationStore, StoreError, StoreFuture};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};

const RESERVATION_COLUMNS: &str = "id, provider, account_id, steps, step, step_titles, status, \
                                   success, error, created_at, finished_at";

/// `PostgreSQL` [`ReservationStore`].
#[derive(Debug, Clone)]
pub struct PostgresReservationStore {
    pool: PgPool,
}

impl PostgresReservationStore {
    /// Store on `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn provider_of(
        &self,
        account_id: AccountId,
        id: ReservationId,
    ) -> Result<Option<ProviderType>, StoreError> {
        let provider: Option<String> = sqlx::query_scalar(
            "SELECT provider FROM reservations WHERE id = $1 AND account_id = $2",
        )
        .bind(id.get())
        .bind(account_id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        provider
            .map(|p| p.parse().map_err(|e| StoreError::Serialization(format!("{e}"))))
            .transpose()
    }

    /// Map a zero-row detail update to the precise error.
    async fn detail_not_updated(
        &self,
        account_id: AccountId,
        id: ReservationId,
        expected: &'static str,
    ) -> StoreError {
        match self.provider_of(account_id, id).await {
            Ok(Some(_)) => StoreError::ProviderMismatch {
                reservation_id: id,
                expected,
            },
            Ok(None) => StoreError::AffectedMismatch {
                expected: 1,
                actual: 0,
            },
            Err(e) => e,
        }
    }

    async fn update_detail(
        &self,
        sql: &str,
        account_id: AccountId,
        id: ReservationId,
        value: String,
        expected: &'static str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(sql)
            .bind(id.get())
            .bind(account_id.get())
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;

        if result.rows_affected() == 1 {
            Ok(())
        } else {
            Err(self.detail_not_updated(account_id, id, expected).await)
        }
    }
}

fn row_to_reservation(row: &PgRow) -> Result<Reservation, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Serialization(e.to_string());
    let provider: String = row.try_get("provider").map_err(decode)?;
    Ok(Reservation {
        id: ReservationId::new(row.try_get("id").map_err(decode)?),
        provider: provider
            .parse()
            .map_err(|e| StoreError::Serialization(format!("{e}")))?,
        account_id: AccountId::new(row.try_get("account_id").map_err(decode)?),
        steps: row.try_get("steps").map_err(decode)?,
        step: row.try_get("step").map_err(decode)?,
        step_titles: row.try_get("step_titles").map_err(decode)?,
        status: row.try_get("status").map_err(decode)?,
        success: row.try_get("success").map_err(decode)?,
        error: row.try_get("error").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        finished_at: row.try_get("finished_at").map_err(decode)?,
    })
}

fn affected(rows: u64) -> Result<(), StoreError> {
    if rows == 1 {
        Ok(())
    } else {
        Err(StoreError::AffectedMismatch {
            expected: 1,
            actual: rows,
        })
    }
}

impl ReservationStore for PostgresReservationStore {
    fn create(&self, reservation: NewReservation) -> StoreFuture<'_, Reservation> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(store_error)?;

            let row = sqlx::query(&format!(
                "INSERT INTO reservations (provider, account_id, steps, step_titles, status) \
                 VALUES ($1, $2, $3, $4, $5) RETURNING {RESERVATION_COLUMNS}"
            ))
            .bind(reservation.detail.provider().as_str())
            .bind(reservation.account_id.get())
            .bind(reservation.steps)
            .bind(&reservation.step_titles)
            .bind(STATUS_CREATED)
            .fetch_one(&mut *tx)
            .await
            .map_err(store_error)?;
            let created = row_to_reservation(&row)?;

            match &reservation.detail {
                ReservationDetail::Noop => {}
                ReservationDetail::Aws(aws) => {
                    sqlx::query(
                        r"
                        INSERT INTO aws_reservation_details
                            (reservation_id, pubkey_id, source_id, image_id, aws_reservation_id, detail)
                        VALUES ($1, $2, $3, $4, $5, $6)
                        ",
                    )
                    .bind(created.id.get())
                    .bind(aws.pubkey_id)
                    .bind(&aws.source_id)
                    .bind(&aws.image_id)
                    .bind(&aws.aws_reservation_id)
                    .bind(Json(&aws.detail))
                    .execute(&mut *tx)
                    .await
                    .map_err(store_error)?;
                }
                ReservationDetail::Gcp(gcp) => {
                    sqlx::query(
                        r"
                        INSERT INTO gcp_reservation_details
                            (reservation_id, pubkey_id, source_id, image_id, gcp_operation_name, detail)
                        VALUES ($1, $2, $3, $4, $5, $6)
                        ",
                    )
                    .bind(created.id.get())
                    .bind(gcp.pubkey_id)
                    .bind(&gcp.source_id)
                    .bind(&gcp.image_id)
                    .bind(&gcp.gcp_operation_name)
                    .bind(Json(&gcp.detail))
                    .execute(&mut *tx)
                    .await
                    .map_err(store_error)?;
                }
                ReservationDetail::Azure(azure) => {
                    sqlx::query(
                        r"
                        INSERT INTO azure_reservation_details
                            (reservation_id, pubkey_id, source_id, image_id, detail)
                        VALUES ($1, $2, $3, $4, $5)
                        ",
                    )
                    .bind(created.id.get())
                    .bind(azure.pubkey_id)
                    .bind(&azure.source_id)
                    .bind(&azure.image_id)
                    .bind(Json(&azure.detail))
                    .execute(&mut *tx)
                    .await
                    .map_err(store_error)?;
                }
            }

            tx.commit().await.map_err(store_error)?;
            tracing::debug!(
                reservation_id = %created.id,
                provider = %created.provider,
                "Reservation created"
            );
            Ok(created)
        })
    }

    fn get(&self, account_id: AccountId, id: ReservationId) -> StoreFuture<'_, Reservation> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1 AND account_id = $2"
            ))
            .bind(id.get())
            .bind(account_id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?
            .ok_or_else(|| StoreError::NotFound(format!("reservation {id}")))?;

            row_to_reservation(&row)
        })
    }

    fn get_detail(
        &self,
        account_id: AccountId,
        id: ReservationId,
    ) -> StoreFuture<'_, ReservationDetail> {
        Box::pin(async move {
            let provider = self
                .provider_of(account_id, id)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("reservation {id}")))?;
            let decode = |e: sqlx::Error| StoreError::Serialization(e.to_string());

            let detail = match provider {
                ProviderType::Noop => ReservationDetail::Noop,
                ProviderType::Aws => {
                    let row = sqlx::query(
                        r"
                        SELECT pubkey_id, source_id, image_id, aws_reservation_id, detail
                        FROM aws_reservation_details WHERE reservation_id = $1
                        ",
                    )
                    .bind(id.get())
                    .fetch_one(&self.pool)
                    .await
                    .map_err(store_error)?;
                    let Json(detail) = row.try_get("detail").map_err(decode)?;
                    ReservationDetail::Aws(AwsReservationDetail {
                        pubkey_id: row.try_get("pubkey_id").map_err(decode)?,
                        source_id: row.try_get("source_id").map_err(decode)?,
                        image_id: row.try_get("image_id").map_err(decode)?,
                        aws_reservation_id: row.try_get("aws_reservation_id").map_err(decode)?,
                        detail,
                    })
                }
                ProviderType::Gcp => {
                    let row = sqlx::query(
                        r"
                        SELECT pubkey_id, source_id, image_id, gcp_operation_name, detail
                        FROM gcp_reservation_details WHERE reservation_id = $1
                        ",
                    )
                    .bind(id.get())
                    .fetch_one(&self.pool)
                    .await
                    .map_err(store_error)?;
                    let Json(detail) = row.try_get("detail").map_err(decode)?;
                    ReservationDetail::Gcp(GcpReservationDetail {
                        pubkey_id: row.try_get("pubkey_id").map_err(decode)?,
                        source_id: row.try_get("source_id").map_err(decode)?,
                        image_id: row.try_get("image_id").map_err(decode)?,
                        gcp_operation_name: row.try_get("gcp_operation_name").map_err(decode)?,
                        detail,
                    })
                }
                ProviderType::Azure => {
                    let row = sqlx::query(
                        r"
                        SELECT pubkey_id, source_id, image_id, detail
                        FROM azure_reservation_details WHERE reservation_id = $1
                        ",
                    )
                    .bind(id.get())
                    .fetch_one(&self.pool)
                    .await
                    .map_err(store_error)?;
                    let Json(detail) = row.try_get("detail").map_err(decode)?;
                    ReservationDetail::Azure(AzureReservationDetail {
                        pubkey_id: row.try_get("pubkey_id").map_err(decode)?,
                        source_id: row.try_get("source_id").map_err(decode)?,
                        image_id: row.try_get("image_id").map_err(decode)?,
                        detail,
                    })
                }
            };
            Ok(detail)
        })
    }

    fn list(
        &self,
        account_id: AccountId,
        limit: i64,
        offset: i64,
    ) -> StoreFuture<'_, Vec<Reservation>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE account_id = $1 \
                 ORDER BY id LIMIT $2 OFFSET $3"
            ))
            .bind(account_id.get())
            .bind(limit.max(0))
            .bind(offset.max(0))
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;

            rows.iter().map(row_to_reservation).collect()
        })
    }

    fn update_status(
        &self,
        account_id: AccountId,
        id: ReservationId,
        update: StatusUpdate,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            // $5 may be NULL: unkeyed updates always count.
            let result = sqlx::query(
                r"
                UPDATE reservations
                SET status = $3,
                    step = CASE
                        WHEN $4 > 0 AND ($5::text IS NULL OR NOT ($5 = ANY (applied_steps)))
                        THEN LEAST(step + $4, steps)
                        ELSE step
                    END,
                    applied_steps = CASE
                        WHEN $4 > 0 AND $5::text IS NOT NULL AND NOT ($5 = ANY (applied_steps))
                        THEN array_append(applied_steps, $5::text)
                        ELSE applied_steps
                    END
                WHERE id = $1 AND account_id = $2
                ",
            )
            .bind(id.get())
            .bind(account_id.get())
            .bind(&update.status)
            .bind(update.add_steps)
            .bind(&update.step_key)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;

            affected(result.rows_affected())
        })
    }

    fn finish_with_success(
        &self,
        account_id: AccountId,
        id: ReservationId,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE reservations SET success = true, finished_at = now()
                WHERE id = $1 AND account_id = $2 AND success IS NULL AND step >= steps
                ",
            )
            .bind(id.get())
            .bind(account_id.get())
            .execute(&self.pool)
            .await
            .map_err(store_error)?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn finish_with_error(
        &self,
        account_id: AccountId,
        id: ReservationId,
        message: String,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE reservations SET success = false, error = $3, finished_at = now()
                WHERE id = $1 AND account_id = $2 AND success IS NULL
                ",
            )
            .bind(id.get())
            .bind(account_id.get())
            .bind(message)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn update_aws_pubkey_name(
        &self,
        account_id: AccountId,
        id: ReservationId,
        pubkey_name: String,
    ) -> StoreFuture<'_, ()> {
        Box::pin(self.update_detail(
            r"
            UPDATE aws_reservation_details d
            SET detail = jsonb_set(d.detail, '{pubkey_name}', to_jsonb($3::text))
            FROM reservations r
            WHERE d.reservation_id = r.id AND r.id = $1 AND r.account_id = $2
            ",
            account_id,
            id,
            pubkey_name,
            "aws",
        ))
    }

    fn update_aws_reservation_id(
        &self,
        account_id: AccountId,
        id: ReservationId,
        aws_reservation_id: String,
    ) -> StoreFuture<'_, ()> {
        Box::pin(self.update_detail(
            r"
            UPDATE aws_reservation_details d
            SET aws_reservation_id = $3
            FROM reservations r
            WHERE d.reservation_id = r.id AND r.id = $1 AND r.account_id = $2
            ",
            account_id,
            id,
            aws_reservation_id,
            "aws",
        ))
    }

    fn update_gcp_operation_name(
        &self,
        account_id: AccountId,
        id: ReservationId,
        operation_name: String,
    ) -> StoreFuture<'_, ()> {
        Box::pin(self.update_detail(
            r"
            UPDATE gcp_reservation_details d
            SET gcp_operation_name = $3
            FROM reservations r
            WHERE d.reservation_id = r.id AND r.id = $1 AND r.account_id = $2
            ",
            account_id,
            id,
            operation_name,
            "gcp",
        ))
    }

    fn update_azure_location(
        &self,
        account_id: AccountId,
        id: ReservationId,
        location: String,
    ) -> StoreFuture<'_, ()> {
        Box::pin(self.update_detail(
            r"
            UPDATE azure_reservation_details d
            SET detail = jsonb_set(d.detail, '{location}', to_jsonb($3::text))
            FROM reservations r
            WHERE d.reservation_id = r.id AND r.id = $1 AND r.account_id = $2
            ",
            account_id,
            id,
            location,
            "azure",
        ))
    }

    fn create_instance(&self, account_id: AccountId, instance: Instance) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                INSERT INTO reservation_instances (reservation_id, instance_id, public_ipv4, public_dns)
                SELECT id, $3, $4, $5 FROM reservations WHERE id = $1 AND account_id = $2
                ",
            )
            .bind(instance.reservation_id.get())
            .bind(account_id.get())
            .bind(&instance.instance_id)
            .bind(&instance.detail.public_ipv4)
            .bind(&instance.detail.public_dns)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;

            if result.rows_affected() == 1 {
                Ok(())
            } else {
                Err(StoreError::NotFound(format!(
                    "reservation {}",
                    instance.reservation_id
                )))
            }
        })
    }

    fn list_instances(
        &self,
        account_id: AccountId,
        id: ReservationId,
    ) -> StoreFuture<'_, Vec<Instance>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT i.reservation_id, i.instance_id, i.public_ipv4, i.public_dns
                FROM reservation_instances i
                JOIN reservations r ON r.id = i.reservation_id
                WHERE r.id = $1 AND r.account_id = $2
                ORDER BY i.instance_id
                ",
            )
            .bind(id.get())
            .bind(account_id.get())
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;

            let decode = |e: sqlx::Error| StoreError::Serialization(e.to_string());
            rows.iter()
                .map(|row| {
                    Ok(Instance {
                        reservation_id: ReservationId::new(
                            row.try_get("reservation_id").map_err(decode)?,
                        ),
                        instance_id: row.try_get("instance_id").map_err(decode)?,
                        detail: InstanceDetail {
                            public_ipv4: row.try_get("public_ipv4").map_err(decode)?,
                            public_dns: row.try_get("public_dns").map_err(decode)?,
                        },
                    })
                })
                .collect()
        })
    }

    fn update_instance_description(
        &self,
        account_id: AccountId,
        id: ReservationId,
        instance_id: String,
        detail: InstanceDetail,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE reservation_instances i
                SET public_ipv4 = $4, public_dns = $5
                FROM reservations r
                WHERE i.reservation_id = r.id AND r.id = $1 AND r.account_id = $2
                  AND i.instance_id = $3
                ",
            )
            .bind(id.get())
            .bind(account_id.get())
            .bind(instance_id)
            .bind(detail.public_ipv4)
            .bind(detail.public_dns)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;

            affected(result.rows_affected())
        })
    }

    fn delete(&self, account_id: AccountId, id: ReservationId) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM reservations WHERE id = $1 AND account_id = $2")
                .bind(id.get())
                .bind(account_id.get())
                .execute(&self.pool)
                .await
                .map_err(store_error)?;

            affected(result.rows_affected())
        })
    }
}
