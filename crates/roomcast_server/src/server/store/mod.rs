#![forbid(unsafe_code)]

pub mod documents;
pub mod kv;

pub use documents::{DocumentStore, MemoryDocuments, Page, SqlDocuments};
pub use kv::{KvStore, MemoryKv, spawn_purge_task};
