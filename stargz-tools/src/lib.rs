pub mod background_task;
pub mod byte_pool;
pub mod lru_cache;
