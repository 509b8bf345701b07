use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{error, info};
use uuid::Uuid;

use bilty_core::repository::{ReservationStore, ReserveRequest};
use bilty_core::{Grant, Reservation, ReservationError, ReservationResult, ReservationStatus};

/// `ReservationStore` backed by the PL/pgSQL procedures in `migrations/`.
/// All locking and conflict resolution happens inside those functions.
pub struct PgReservationStore {
    pool: PgPool,
    max_range: u32,
}

impl PgReservationStore {
    pub fn new(pool: PgPool, max_range: u32) -> Self {
        Self { pool, max_range }
    }
}

#[derive(sqlx::FromRow)]
struct GrantRow {
    reservation_id: Uuid,
    gr_no: String,
    gr_number: i64,
    expires_at: DateTime<Utc>,
}

impl From<GrantRow> for Grant {
    fn from(row: GrantRow) -> Self {
        Grant {
            reservation_id: row.reservation_id,
            gr_no: row.gr_no,
            gr_number: row.gr_number as u64,
            expires_at: row.expires_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ReservationRow {
    id: Uuid,
    branch_id: Uuid,
    series_prefix: String,
    gr_no: String,
    gr_number: i64,
    holder_session_id: String,
    status: String,
    reserved_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    ttl_seconds: i32,
    saved_record_ref: Option<String>,
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = ReservationError;

    fn try_from(row: ReservationRow) -> Result<Self, Self::Error> {
        let status = ReservationStatus::parse(&row.status).ok_or_else(|| {
            ReservationError::Transport(format!("unknown reservation status {:?}", row.status))
        })?;
        Ok(Reservation {
            id: row.id,
            branch_id: row.branch_id,
            series_prefix: row.series_prefix,
            gr_no: row.gr_no,
            gr_number: row.gr_number as u64,
            holder_session_id: row.holder_session_id.into(),
            status,
            reserved_at: row.reserved_at,
            expires_at: row.expires_at,
            updated_at: row.updated_at,
            ttl_seconds: i64::from(row.ttl_seconds),
            saved_record_ref: row.saved_record_ref,
        })
    }
}

/// Translate the procedures' SQLSTATEs into the reservation taxonomy.
/// Anything that is not one of ours means the backend could not answer.
fn map_db_error(err: sqlx::Error, reservation_id: Option<Uuid>, req: Option<&ReserveRequest>) -> ReservationError {
    if let sqlx::Error::Database(db) = &err {
        let message = db.message().to_string();
        match db.code().as_deref() {
            Some("GR001") => {
                if let Some(req) = req {
                    return ReservationError::Exhausted {
                        branch_id: req.branch_id,
                        prefix: req.series_prefix.clone(),
                    };
                }
            }
            Some("GR002") => return ReservationError::NotFound(reservation_id.unwrap_or_default()),
            Some("GR003") => return ReservationError::Expired(reservation_id.unwrap_or_default()),
            Some("GR004") => return ReservationError::Conflict(message),
            Some("GR005") => return ReservationError::InvalidRequest(message),
            // unique_violation: the partial index caught a race the procedure missed
            Some("23505") => return ReservationError::Conflict(message),
            _ => {}
        }
    }
    error!("Reservation store error: {}", err);
    ReservationError::Transport(err.to_string())
}

#[async_trait]
impl ReservationStore for PgReservationStore {
    async fn reserve_next(&self, req: &ReserveRequest) -> ReservationResult<Grant> {
        let mut grants = self.reserve_range(req, 1).await?;
        grants
            .pop()
            .ok_or_else(|| ReservationError::Transport("reserve returned no rows".into()))
    }

    async fn reserve_range(&self, req: &ReserveRequest, count: u32) -> ReservationResult<Vec<Grant>> {
        if count == 0 || count > self.max_range {
            return Err(ReservationError::InvalidRequest(format!(
                "range size must be between 1 and {}, got {}",
                self.max_range, count
            )));
        }

        let rows: Vec<GrantRow> = sqlx::query_as(
            "SELECT reservation_id, gr_no, gr_number, expires_at FROM gr_reserve_range($1, $2, $3, $4, $5)",
        )
        .bind(req.branch_id)
        .bind(&req.series_prefix)
        .bind(&req.holder_session_id)
        .bind(req.ttl().num_seconds() as i32)
        .bind(count as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_db_error(e, None, Some(req)))?;

        if let Some(first) = rows.first() {
            info!(
                "Reserved {} GR number(s) from {} for branch {} starting at {}",
                rows.len(),
                req.series_prefix,
                req.branch_id,
                first.gr_no
            );
        }
        Ok(rows.into_iter().map(Grant::from).collect())
    }

    async fn heartbeat(&self, reservation_id: Uuid, holder_session_id: &str) -> ReservationResult<DateTime<Utc>> {
        // NULL: the hold had lapsed and the procedure flipped it to EXPIRED.
        let renewed: Option<DateTime<Utc>> = sqlx::query_scalar("SELECT gr_heartbeat($1, $2)")
            .bind(reservation_id)
            .bind(holder_session_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_db_error(e, Some(reservation_id), None))?;
        renewed.ok_or(ReservationError::Expired(reservation_id))
    }

    async fn release(
        &self,
        reservation_id: Uuid,
        holder_session_id: &str,
    ) -> ReservationResult<Option<ReservationStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT gr_release($1, $2)")
            .bind(reservation_id)
            .bind(holder_session_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_db_error(e, Some(reservation_id), None))?;
        status
            .map(|s| {
                ReservationStatus::parse(&s).ok_or_else(|| {
                    ReservationError::Transport(format!("unknown reservation status {:?}", s))
                })
            })
            .transpose()
    }

    async fn complete(
        &self,
        reservation_id: Uuid,
        holder_session_id: &str,
        saved_record_ref: &str,
    ) -> ReservationResult<()> {
        let completed: bool = sqlx::query_scalar("SELECT gr_complete($1, $2, $3)")
            .bind(reservation_id)
            .bind(holder_session_id)
            .bind(saved_record_ref)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_db_error(e, Some(reservation_id), None))?;
        if !completed {
            return Err(ReservationError::Expired(reservation_id));
        }
        info!("Completed reservation {} as record {}", reservation_id, saved_record_ref);
        Ok(())
    }

    async fn sweep_expired(&self) -> ReservationResult<usize> {
        let swept: i32 = sqlx::query_scalar("SELECT gr_sweep_expired()")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_db_error(e, None, None))?;
        Ok(swept.max(0) as usize)
    }

    async fn live_holds(&self, branch_id: Uuid) -> ReservationResult<Vec<Reservation>> {
        let rows: Vec<ReservationRow> = sqlx::query_as(
            r#"
            SELECT id, branch_id, series_prefix, gr_no, gr_number, holder_session_id, status,
                   reserved_at, expires_at, updated_at, ttl_seconds, saved_record_ref
              FROM gr_reservations
             WHERE branch_id = $1
               AND status = 'ACTIVE'
               AND expires_at > NOW()
             ORDER BY series_prefix, gr_number
            "#,
        )
        .bind(branch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_db_error(e, None, None))?;

        rows.into_iter().map(Reservation::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_retryable() {
        let err = map_db_error(sqlx::Error::PoolTimedOut, None, None);
        assert!(err.is_retryable());
        assert_eq!(err.code(), "TRANSPORT");
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let row = ReservationRow {
            id: Uuid::new_v4(),
            branch_id: Uuid::new_v4(),
            series_prefix: "KOL".into(),
            gr_no: "KOL000001".into(),
            gr_number: 1,
            holder_session_id: "tab-1".into(),
            status: "PENDING".into(),
            reserved_at: Utc::now(),
            expires_at: Utc::now(),
            updated_at: Utc::now(),
            ttl_seconds: 180,
            saved_record_ref: None,
        };
        assert!(Reservation::try_from(row).is_err());
    }
}
