//! Database module for SQLite operations.
//!
//! This module provides:
//! - Database initialization and migrations
//! - SQLite pragma configuration
//! - Repository layer: market configuration and the durable ledger store

pub mod migrations;
pub mod repo;

pub use migrations::init_db;
pub use repo::{ChunkCommitRow, ChunkStatus, Repository};
