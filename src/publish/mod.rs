// src/publish/mod.rs
//! Sinks a pipeline writes to: PostgreSQL, the object store, the catalog and
//! the chat webhook.

pub mod datagouv;
pub mod mattermost;
pub mod minio;
pub mod postgres;

pub use datagouv::{CommunityResource, DatagouvClient};
pub use mattermost::Mattermost;
pub use minio::{FileTransfer, MinioClient};
pub use postgres::SqlFile;
