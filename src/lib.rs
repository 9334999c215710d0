//! # Knowledge Sync
//!
//! A knowledge-source synchronization pipeline. Knowledge groups (web
//! pages, GitHub issues and discussions, Linear issues and projects,
//! Confluence spaces, YouTube channels and videos) are synced in two
//! phases: a group job discovers items page by page, and item jobs fetch
//! each item, chunk its markdown, and reconcile it with stored content.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌─────────────┐   ┌────────────┐
//! │ Triggers │──▶│ group queue │──▶│ item queue  │──▶│ Reconciler │
//! │ HTTP/CLI │   │ (discovery) │   │ (fetch)     │   │ chunk+store│
//! └──────────┘   └──────┬──────┘   └──────┬──────┘   └────────────┘
//!                       ▲  next cursor    │
//!                       └─────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ksync init
//! ksync group add --type web --title Docs --page https://example.com/guide
//! ksync sync <group-id>
//! ksync serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Failure taxonomy and retry classification |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`repo`] | Knowledge group and scrape item repository |
//! | [`queue`] | Durable job queues with retry and backoff |
//! | [`worker`] | Bounded worker pools |
//! | [`chunk`] | Markdown chunking |
//! | [`content`] | Content reconciler and credit gate |
//! | [`sources`] | Source trait and registry |
//! | [`source_web`] | Web pages |
//! | [`source_github`] | GitHub issues and discussions |
//! | [`source_linear`] | Linear issues and projects |
//! | [`source_confluence`] | Confluence spaces |
//! | [`source_youtube`] | YouTube channels and videos |
//! | [`pipeline`] | Sync orchestration and completion detection |
//! | [`server`] | HTTP triggers |

pub mod chunk;
pub mod config;
pub mod content;
pub mod db;
pub mod error;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod repo;
pub mod server;
pub mod source_confluence;
pub mod source_github;
pub mod source_linear;
pub mod source_web;
pub mod source_youtube;
pub mod sources;
pub mod worker;
