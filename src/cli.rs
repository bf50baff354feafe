//! Command-line interface definitions for fishbowl.
//!
//! Uses clap's derive API. Running with no subcommand starts the
//! mediation server; the subcommands are an operator client that talks
//! to a running server over HTTP/WebSocket.

use clap::{Parser, Subcommand};

/// Policy-gated mediation service for sandboxed agents.
///
/// fishbowl sits between an autonomous agent and the outside world.
/// Network connections, host commands, package installs, file exports,
/// and git pushes are intercepted, evaluated against rules, and either
/// auto-resolved or queued for your decision.
#[derive(Parser, Debug)]
#[command(name = "fishbowl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to run (or omit to start the server).
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Server base URL for operator subcommands.
    ///
    /// Defaults to http://127.0.0.1:<SERVER_PORT>.
    #[arg(long = "server", value_name = "URL")]
    pub server: Option<String>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Operator subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print pending permission requests.
    List,

    /// Approve requests by id, or a whole category with --all.
    Approve {
        /// Request ids (req-N).
        ids: Vec<String>,

        /// Approve every pending request in this category.
        #[arg(long = "all", value_name = "CATEGORY", conflicts_with = "ids")]
        all: Option<String>,
    },

    /// Deny requests by id, or a whole category with --all.
    Deny {
        /// Request ids (req-N).
        ids: Vec<String>,

        /// Deny every pending request in this category.
        #[arg(long = "all", value_name = "CATEGORY", conflicts_with = "ids")]
        all: Option<String>,
    },

    /// Stream queue events and decide interactively.
    ///
    /// Stdin commands: `a <id>` approve, `d <id>` deny,
    /// `A <category>` approve all, `D <category>` deny all, `q` quit.
    Watch,

    /// Print the configured allow and deny rules.
    Rules,

    /// Add an allow rule, e.g. `fishbowl allow "network(*.github.com)"`.
    Allow {
        /// Rule string: category(pattern) or bare category.
        rule: String,
    },

    /// Add a deny rule.
    DenyRule {
        /// Rule string: category(pattern) or bare category.
        rule: String,
    },
}
