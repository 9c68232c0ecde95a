//! Bad-word pattern matching.
//!
//! Literal patterns share one case-insensitive Aho-Corasick automaton;
//! regex patterns are compiled individually. When several rules match the
//! same message, the rule listed first in the configuration wins.

use aho_corasick::AhoCorasick;
use regex::Regex;

use crate::config::BadWordRule;
use crate::error::{AgentError, AgentResult};

/// Compiled bad-word rule set.
pub struct BadWordSet {
    rules: Vec<BadWordRule>,
    /// Automaton over the literal patterns.
    literals: Option<AhoCorasick>,
    /// Rule index for each literal pattern, in automaton order.
    literal_rule_index: Vec<usize>,
    /// Compiled regex rules with their rule indices.
    regexes: Vec<(Regex, usize)>,
}

impl BadWordSet {
    /// Compile the configured rules. Invalid regexes are rejected here so
    /// startup validation and runtime stay in agreement.
    pub fn compile(rules: &[BadWordRule]) -> AgentResult<Self> {
        let mut literal_patterns = Vec::new();
        let mut literal_rule_index = Vec::new();
        let mut regexes = Vec::new();

        for (index, rule) in rules.iter().enumerate() {
            if rule.regex {
                let compiled = Regex::new(&format!("(?i){}", rule.pattern)).map_err(|e| {
                    AgentError::Config(format!("bad-word regex `{}`: {}", rule.pattern, e))
                })?;
                regexes.push((compiled, index));
            } else {
                literal_patterns.push(rule.pattern.to_lowercase());
                literal_rule_index.push(index);
            }
        }

        let literals = if literal_patterns.is_empty() {
            None
        } else {
            Some(
                AhoCorasick::builder()
                    .ascii_case_insensitive(true)
                    .build(&literal_patterns)
                    .map_err(|e| {
                        AgentError::Config(format!("bad-word pattern set: {}", e))
                    })?,
            )
        };

        Ok(Self {
            rules: rules.to_vec(),
            literals,
            literal_rule_index,
            regexes,
        })
    }

    /// Whether any rules are loaded.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First matching rule for a message, respecting per-rule channel
    /// filters and configuration order.
    pub fn first_match(&self, channel: &str, text: &str) -> Option<&BadWordRule> {
        let mut best: Option<usize> = None;

        if let Some(automaton) = &self.literals {
            for hit in automaton.find_iter(text) {
                let rule_index = self.literal_rule_index[hit.pattern().as_usize()];
                if self.applies(rule_index, channel) {
                    best = Some(best.map_or(rule_index, |b| b.min(rule_index)));
                }
            }
        }

        for (regex, rule_index) in &self.regexes {
            if best.is_some_and(|b| b <= *rule_index) {
                continue;
            }
            if self.applies(*rule_index, channel) && regex.is_match(text) {
                best = Some(*rule_index);
            }
        }

        best.map(|index| &self.rules[index])
    }

    fn applies(&self, rule_index: usize, channel: &str) -> bool {
        let channels = &self.rules[rule_index].channels;
        channels.is_empty() || channels.iter().any(|c| c.eq_ignore_ascii_case(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtectionAction;

    fn literal(pattern: &str, channels: &[&str]) -> BadWordRule {
        BadWordRule {
            pattern: pattern.to_string(),
            regex: false,
            action: ProtectionAction::Warn,
            channels: channels.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn regex(pattern: &str, action: ProtectionAction) -> BadWordRule {
        BadWordRule {
            pattern: pattern.to_string(),
            regex: true,
            action,
            channels: Vec::new(),
        }
    }

    #[test]
    fn literal_matching_is_case_insensitive() {
        let set = BadWordSet::compile(&[literal("spamword", &[])]).unwrap();
        assert!(set.first_match("#chan", "buy SPAMWORD today").is_some());
        assert!(set.first_match("#chan", "innocent text").is_none());
    }

    #[test]
    fn regex_rules_match() {
        let set =
            BadWordSet::compile(&[regex(r"free\s+money", ProtectionAction::Kick)]).unwrap();
        let rule = set.first_match("#chan", "get FREE   MONEY now").unwrap();
        assert_eq!(rule.action, ProtectionAction::Kick);
    }

    #[test]
    fn first_rule_in_config_order_wins() {
        let set = BadWordSet::compile(&[
            regex("casino", ProtectionAction::Kickban),
            literal("casino night", &[]),
        ])
        .unwrap();
        let rule = set.first_match("#chan", "casino night!").unwrap();
        assert!(rule.regex);
        assert_eq!(rule.action, ProtectionAction::Kickban);
    }

    #[test]
    fn channel_filter_restricts_rule() {
        let set = BadWordSet::compile(&[literal("offtopic", &["#serious"])]).unwrap();
        assert!(set.first_match("#SERIOUS", "offtopic chatter").is_some());
        assert!(set.first_match("#fun", "offtopic chatter").is_none());
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let result = BadWordSet::compile(&[regex("(unclosed", ProtectionAction::Warn)]);
        assert!(result.is_err());
    }
}
