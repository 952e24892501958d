//! Core library for the coop offline worker: the embedded record store, the
//! versioned cache-bucket storage, and the shared data model.

pub mod cache;
pub mod db;
pub mod models;
