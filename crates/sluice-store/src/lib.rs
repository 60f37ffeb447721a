pub mod checkpoints;
pub mod db;
pub mod domain;
pub mod events;

pub use db::{connect_pool, ensure_schema, StoreConfig};
pub use domain::{CheckpointStatus, NewEvent, WorkerCheckpoint};
