//! # Harvester Core
//!
//! Shared, I/O-free logic for the metadata harvester: the document model,
//! canonical hashing, JSON-path evaluation, extraction objectives and the
//! task graph that drives per-document enrichment.
//!
//! This crate contains no tokio, sqlx, HTTP or filesystem dependencies.
//! Everything here is deterministic so it can be unit tested in isolation
//! and reused by alternative front-ends.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Enumerations, pipeline entries, metadata and seeds |
//! | [`document`] | `Document` value with seed/update/pending/cancel rules |
//! | [`hashing`] | Canonical JSON serialization and content hashes |
//! | [`json_path`] | Minimal JSON-path selector used by objectives and tasks |
//! | [`objective`] | Field-level extraction rules (`Extractor = Path \| Fn`) |
//! | [`tasks`] | Task configs, check predicates, ordering and invalidation |

pub mod document;
pub mod hashing;
pub mod json_path;
pub mod models;
pub mod objective;
pub mod tasks;
