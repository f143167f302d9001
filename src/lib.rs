#![deny(warnings, clippy::all, clippy::pedantic)]
#![allow(
    // Acceptable for trait naming consistency (e.g., OrchestratorStore, InMemoryStore)
    clippy::module_name_repetitions,

    // Bayesian scoring and latency math work in f64/f32 throughout
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,

    // Domain logic often requires helper declarations mid-function for readability
    clippy::items_after_statements,

    // Error context via anyhow::Context / thiserror already documents failure modes
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,

    // Technical identifiers (VRAM, LoRA, WebSocket) don't need markdown formatting
    clippy::doc_markdown,

    clippy::redundant_closure,
    clippy::uninlined_format_args,
    clippy::option_if_let_else,
    clippy::or_fun_call,
    clippy::needless_pass_by_value,
    clippy::must_use_candidate,
    clippy::collapsible_if,
    clippy::explicit_iter_loop
)]

pub mod aggregator;
pub(crate) mod api;
pub mod app;
pub mod config;
pub mod executor;
pub mod health;
pub mod iteration;
pub mod model;
pub mod observability;
pub mod preference;
pub mod registry;
pub mod router;
pub(crate) mod store;
pub mod template;
pub mod util;
pub mod worker_client;
