//! # Parley Lens
//!
//! Streams manipulation, cognitive-bias and fallacy highlights for long
//! negotiation transcripts.
//!
//! A transcript is split into overlapping chunks, each chunk is sent to a
//! chat-completion model, and the findings are mapped back onto the original
//! text, de-duplicated and streamed to the caller as they arrive. A shared
//! daily token budget guards every model call.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌────────────┐   ┌──────────┐
//! │ HTTP / CLI│──▶│ Orchestrator │──▶│ ChunkTasks │──▶│   LLM    │
//! └─────▲─────┘   └──────┬───────┘   └─────┬──────┘   └──────────┘
//!       │  events        │ merge           │ charge
//!       └────────────────┤                 ▼
//!                        ▼           ┌────────────┐
//!                   ┌─────────┐      │   Ledger   │
//!                   │ SQLite  │◀─────┴────────────┘
//!                   └─────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! parley init
//! parley analyze call.txt --client-id acme
//! parley serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | Tracing subscriber setup |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`sqlite_store`] | SQLite-backed analysis store and ledger rows |
//! | [`llm`] | Chat-completion client abstraction |
//! | [`prompt`] | Prompt construction |
//! | [`budget`] | Daily token budget with lockout |
//! | [`analyzer`] | Per-chunk model call and finding validation |
//! | [`orchestrator`] | End-to-end run driver |
//! | [`stream`] | Event channel between run and transport |
//! | [`extract`] | Uploaded file to text |
//! | [`server`] | HTTP API with SSE streaming |
//! | [`services`] | Shared store, ledger and orchestrator wiring |
//! | [`report`] | CLI event rendering |

pub mod analyze_cmd;
pub mod analyzer;
pub mod budget;
pub mod config;
pub mod db;
pub mod extract;
pub mod get;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod orchestrator;
pub mod prompt;
pub mod report;
pub mod server;
pub mod services;
pub mod sqlite_store;
pub mod stream;
pub mod usage;
