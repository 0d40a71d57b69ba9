//! # Harvester
//!
//! A metadata harvesting and indexing pipeline.
//!
//! Harvester pulls records from external sources (OAI-PMH endpoints, JSON
//! APIs, shell commands), reconciles them into versioned documents in
//! SQLite, runs per-document enrichment tasks against a deduplicating
//! resource cache, and pushes each finished dataset version into a search
//! index behind an alias that is swapped atomically on promotion.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌────────────┐   ┌───────────┐
//! │ Sources  │──▶│  Seeder   │──▶│  Pipeline   │──▶│ Dispatcher │
//! │ OAI/JSON │   │ reconcile │   │ doc tasks   │   │ set/version│
//! └────┬─────┘   └────┬─────┘   └─────┬──────┘   └─────┬─────┘
//!      │              │               │                │
//!      ▼              ▼               ▼                ▼
//! ┌──────────────────────────────────────────┐   ┌───────────┐
//! │     SQLite store + resource cache         │   │  Search   │
//! └──────────────────────────────────────────┘   │  backend  │
//!                                                └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! harvest init                  # create database, register datasets
//! harvest sources               # list configured sources
//! harvest run products          # harvest, process, index and promote
//! harvest status products
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Persisted record types |
//! | [`store`] | SQLite persistence |
//! | [`resources`] | Resource cache over HTTP and shell calls |
//! | [`sources`] | Source extractors and pagination |
//! | [`seeder`] | Seeding and historic reconciliation |
//! | [`pipeline`] | Document task processing |
//! | [`dispatcher`] | Set and version task dispatch |
//! | [`integrity`] | Set integrity check |
//! | [`index`] | Search backends and index management |
//! | [`harvest`] | Orchestration behind the CLI |
//! | [`status`] | Status reporting |

pub mod blob;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod harvest;
pub mod index;
pub mod integrity;
pub mod kinds;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod resources;
pub mod seeder;
pub mod sources;
pub mod status;
pub mod store;
pub mod template;

pub use harvester_core as core;
