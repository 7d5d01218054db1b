//! Wire dialect selection.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Which protocol the agent process speaks.
///
/// Determines the subcommand appended after `[agent].args` when the
/// process is launched.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// One-directional JSONL event stream, one process per turn.
    Exec,
    /// Bidirectional JSON-RPC over stdio. Default.
    #[default]
    AppServer,
}

impl Dialect {
    /// Arguments selecting this dialect.
    #[must_use]
    pub fn launch_args(self) -> &'static [&'static str] {
        match self {
            Self::Exec => &["exec", "--json"],
            Self::AppServer => &["app-server"],
        }
    }
}
