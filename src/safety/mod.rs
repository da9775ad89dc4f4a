//! Command Safety Gate
//!
//! Pure policy deciding whether a shell command proposed by the agent may
//! run. Evaluation performs no I/O and keeps no state, so the same command
//! and policy always produce the same [`CommandVerdict`].
//!
//! Chained commands are split into sub-commands first; if any sub-command is
//! denied, the whole line is denied. Anything the splitter cannot parse with
//! confidence is denied as well.

pub mod gate;
pub mod split;

pub use gate::{evaluate, evaluate_with, CommandVerdict, Rule, SafetyPolicy, Verdict};
pub use split::{split_command, ParsedCommand, Redirect, Segment, Separator, SplitError};
