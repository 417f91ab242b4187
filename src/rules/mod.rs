//! Rate limit rules: model, path matching and the admin-owned rule table.

mod pattern;
mod rule;
mod store;

pub use pattern::{glob_match, PathPattern};
pub use rule::{BodyLimitSettings, ClaimNames, LimitType, QueueSettings, Rule, RuleSpec};
pub use store::{CompiledRule, RuleSnapshot, RuleStore};
