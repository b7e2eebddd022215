use std::sync::Arc;

use crate::config::Config;
use crate::db::{create_pool as create_db_pool, DbPool};
use crate::kafka::{create_consumer, create_producer, KafkaConsumer, KafkaProducer};
use crate::redis::{create_pool as create_redis_pool, RedisPool};
use crate::storage::{pg::PgStorage, StorageHandle};

/// Shared handles every listener needs: configuration, pools, producer and
/// the storage gateway. Cheap to clone, one per process.
#[derive(Clone)]
pub struct MessengerContext {
    pub config: Arc<Config>,
    pub db_pool: Arc<DbPool>,
    pub redis_pool: RedisPool,
    pub producer: KafkaProducer,
    pub storage: StorageHandle,
}

impl MessengerContext {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let db_pool = create_db_pool(&config.database).await?;
        let redis_pool = create_redis_pool(&config.redis).await?;
        let producer = create_producer(&config.kafka)?;
        let storage = PgStorage::new(db_pool.clone()).into_handle();

        Ok(MessengerContext {
            config: Arc::new(config),
            db_pool,
            redis_pool,
            producer,
            storage,
        })
    }

    pub fn create_consumer(&self, group_id: Option<&str>) -> anyhow::Result<KafkaConsumer> {
        create_consumer(&self.config.kafka, group_id)
    }
}
