use amalgam::node::compare::are_deep_equal;
use amalgam::node::NodeManager;
use proptest::prelude::*;

fn round_trips(src: &str) {
    let enm = NodeManager::new();
    let (first, warnings) = amalgam::code::parse_to_node(src, &enm);
    assert!(warnings.is_empty(), "{src}: {warnings:?}");
    let text = amalgam::code::unparse_node(first.node);
    let (second, warnings) = amalgam::code::parse_to_node(&text, &enm);
    assert!(warnings.is_empty(), "{text}: {warnings:?}");
    assert!(
        are_deep_equal(first.node, second.node),
        "{src} -> {text} did not round-trip"
    );
}

#[test]
fn canonical_programs_round_trip() {
    let _ = env_logger::try_init();
    for src in [
        "(sequence (assign \"x\" 3) (retrieve \"x\"))",
        "(list 1 -2.5 \"three\" (null) (true) (false))",
        "(assoc \"a\" 1 \"b\" (list 2 3))",
        "#label (lambda (+ 1 2))",
        "||(map (lambda (current_value)) (list 1 2))",
        "(if (< 1 2) \"yes\" \"no\")",
        "(while (true) (conclude 1))",
        "(let (assoc \"s\" \"with \\\"escapes\\\" and\\nnewlines\") (retrieve \"s\"))",
        "(query_nearest_generalized_distance 2 (list \"x\") (list 3))",
    ] {
        round_trips(src);
    }
}

#[test]
fn comments_are_preserved_through_unparse() {
    let enm = NodeManager::new();
    let (node, warnings) = amalgam::code::parse_to_node("; top comment\n(list 1)", &enm);
    assert!(warnings.is_empty());
    let text = amalgam::code::unparse_node(node.node);
    assert!(text.contains("; top comment"), "{text}");
}

#[test]
fn parse_failures_warn_but_do_not_panic() {
    let enm = NodeManager::new();
    let (_, warnings) = amalgam::code::parse_to_node("(sequence (broken", &enm);
    assert!(!warnings.is_empty());

    let (node, _) = amalgam::code::parse_to_node("", &enm);
    assert!(node.is_null());
}

proptest! {
    // numbers format canonically and reparse to the same value
    #[test]
    fn number_formatting_round_trips(value in proptest::num::f64::NORMAL | proptest::num::f64::ZERO) {
        let text = amalgam_parser::format_number(value);
        let reparsed = amalgam::node::compare::parse_number(&text).unwrap();
        prop_assert_eq!(value, reparsed);
    }

    // arbitrary strings survive a quote-escape-unescape cycle
    #[test]
    fn string_literals_round_trip(s in "\\PC*") {
        let enm = NodeManager::new();
        let src = amalgam_parser::unparse(&amalgam_parser::Sexpr::string(&s));
        let (node, warnings) = amalgam::code::parse_to_node(&src, &enm);
        prop_assert!(warnings.is_empty());
        prop_assert_eq!(node.node.string_value(), s);
    }
}
