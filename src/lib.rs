//! fishbowl: policy-gated mediation between a sandboxed agent and the
//! outside world.
//!
//! Every agent action with external effect (outbound HTTP(S), host
//! command execution, package installs, file exports, git pushes to the
//! real remote, sandbox reconfiguration) is intercepted, classified
//! into a category, evaluated against rules and a per-category mode,
//! and either auto-resolved or queued for a human decision. The agent
//! keeps running while decisions are pending; approvals are
//! asynchronous and concurrent.
//!
//! # Architecture
//!
//! - **rules**: pure rule parsing, glob matching, and evaluation
//! - **queue**: the permission request registry with per-request
//!   waiters, event fan-out, and coalesced persistence
//! - **audit**: append-only JSONL audit trail
//! - **config**: sandbox configuration with hardened category modes
//! - **brokers**: exec and package subrequest machinery
//! - **sync**: workspace-to-host mirror, approve-on-apply edits, git
//!   staging sync
//! - **proxy**: the mediating HTTP/CONNECT proxy
//! - **control**: HTTP/WebSocket control plane, uptime timer, graceful
//!   shutdown

#![warn(clippy::all)]

pub mod audit;
pub mod brokers;
pub mod cli;
pub mod cli_handler;
pub mod config;
pub mod control;
pub mod proxy;
pub mod queue;
pub mod rules;
pub mod sync;
