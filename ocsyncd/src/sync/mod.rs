pub mod conflict;
pub mod engine;
pub mod index;
pub mod local_storage;
mod locks;
pub mod offline;
pub mod operations;
pub mod paths;
pub mod reconcile;
pub mod transfer;
