use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::time::Duration;
use tracing::info;

use bilty_core::GrSeries;

#[derive(Clone)]
pub struct DbClient {
    pub pool: Pool<Postgres>,
}

impl DbClient {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(3))
            .connect(connection_string)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running database migrations...");
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await?;
        info!("Migrations completed successfully.");
        Ok(())
    }

    /// Upsert configured GR books. Shrinking a range below numbers already
    /// issued is allowed; those numbers simply stop being handed out.
    pub async fn seed_series(&self, series: &[GrSeries]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        for s in series {
            let start = i64::try_from(s.start).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
            let end = i64::try_from(s.end).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
            sqlx::query(
                r#"
                INSERT INTO gr_series (branch_id, prefix, range_start, range_end, width)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (branch_id, prefix)
                DO UPDATE SET range_start = EXCLUDED.range_start,
                              range_end = EXCLUDED.range_end,
                              width = EXCLUDED.width
                "#,
            )
            .bind(s.branch_id)
            .bind(&s.prefix)
            .bind(start)
            .bind(end)
            .bind(s.width as i32)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!("Seeded {} GR series", series.len());
        Ok(())
    }
}
