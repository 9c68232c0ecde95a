//! MODE string parsing against an ISUPPORT snapshot.

use crate::isupport::{Isupport, ModeClass};

/// One mode flip from a MODE command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModeChange {
    /// True for `+`, false for `-`.
    pub add: bool,
    /// The mode letter.
    pub mode: char,
    /// The consumed parameter, when the mode class takes one.
    pub arg: Option<String>,
}

/// Parse a mode string plus its parameters into individual changes.
///
/// Parameter consumption follows the ISUPPORT classes: prefix modes and
/// classes A/B always take one, class C only when setting, class D and
/// unknown letters never. A change whose parameter is missing from the
/// line is recorded with `arg = None` rather than stealing a later one.
pub fn parse_mode_changes(
    modestring: &str,
    args: &[String],
    isupport: &Isupport,
) -> Vec<ModeChange> {
    let mut changes = Vec::new();
    let mut add = true;
    let mut args_iter = args.iter();

    for c in modestring.chars() {
        match c {
            '+' => add = true,
            '-' => add = false,
            _ => {
                let takes_arg = match isupport.mode_class(c) {
                    Some(ModeClass::Prefix | ModeClass::TypeA | ModeClass::TypeB) => true,
                    Some(ModeClass::TypeC) => add,
                    Some(ModeClass::TypeD) | None => false,
                };
                let arg = if takes_arg {
                    args_iter.next().cloned()
                } else {
                    None
                };
                changes.push(ModeChange { add, mode: c, arg });
            }
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn mixed_mode_line() {
        let isupport = Isupport::default();
        let changes = parse_mode_changes(
            "+ovb",
            &args(&["alice", "bob", "*!*@bad.host"]),
            &isupport,
        );
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0], ModeChange { add: true, mode: 'o', arg: Some("alice".into()) });
        assert_eq!(changes[1], ModeChange { add: true, mode: 'v', arg: Some("bob".into()) });
        assert_eq!(changes[2], ModeChange { add: true, mode: 'b', arg: Some("*!*@bad.host".into()) });
    }

    #[test]
    fn class_c_param_only_on_set() {
        let isupport = Isupport::default();
        let set = parse_mode_changes("+l", &args(&["50"]), &isupport);
        assert_eq!(set[0].arg.as_deref(), Some("50"));

        let unset = parse_mode_changes("-l", &args(&["stray"]), &isupport);
        assert_eq!(unset[0].arg, None);
    }

    #[test]
    fn flags_never_consume() {
        let isupport = Isupport::default();
        let changes = parse_mode_changes("+imnt", &args(&["stray"]), &isupport);
        assert!(changes.iter().all(|c| c.arg.is_none()));
        assert_eq!(changes.len(), 4);
    }

    #[test]
    fn direction_toggles_mid_string() {
        let isupport = Isupport::default();
        let changes = parse_mode_changes("+o-o", &args(&["alice", "bob"]), &isupport);
        assert!(changes[0].add);
        assert!(!changes[1].add);
        assert_eq!(changes[1].arg.as_deref(), Some("bob"));
    }

    #[test]
    fn missing_params_do_not_shift() {
        let isupport = Isupport::default();
        let changes = parse_mode_changes("+ok", &args(&["alice"]), &isupport);
        assert_eq!(changes[0].arg.as_deref(), Some("alice"));
        assert_eq!(changes[1].arg, None);
    }
}
