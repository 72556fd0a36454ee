//! Armitage — a governance enforcement gateway for LLM access.
//!
//! Single Rust binary. Sits between untrusted developer clients and the
//! sensitive back ends (model providers, encrypted secret store, immutable
//! audit log, identity provider) and turns client-side honor-system
//! governance into a server-side hard gate: identity, project
//! authorization, budget reservation, inference, PII scrubbing, and async
//! audit all happen before a caller sees a model response.
//!
//! See `DESIGN.md` for full architecture documentation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod db;
pub mod error;
pub mod logging;

pub mod identity;
pub mod ledger;
pub mod redaction;
pub mod vault;

pub mod inference;
pub mod telemetry;

pub mod pipeline;
pub mod workbench;

pub mod http;
