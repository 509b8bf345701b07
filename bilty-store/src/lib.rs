pub mod app_config;
pub mod database;
pub mod events;
pub mod redis_repo;
pub mod reservation_repo;

pub use database::DbClient;
pub use events::PgChangeFeed;
pub use redis_repo::RedisClient;
pub use reservation_repo::PgReservationStore;
