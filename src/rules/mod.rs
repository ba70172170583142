pub mod parser;
mod set;

pub use parser::{
    format_allow_rule, format_block_rule, parse, parse_list_line, parse_many, Rule, RuleKind,
};
pub use set::{CustomRule, CustomRuleSet, Whitelist};
