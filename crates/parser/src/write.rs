//! The unparser: serializes an [`Sexpr`](crate::Sexpr) back to text.

use crate::{format_number, Sexpr, SexprKind};

/// Recognizes a numeric token, including the leading-dot spellings of the
/// non-finite values.
pub(crate) fn number_from_token(text: &str) -> Option<f64> {
    match text {
        ".infinity" => return Some(f64::INFINITY),
        "-.infinity" => return Some(f64::NEG_INFINITY),
        ".nan" => return Some(f64::NAN),
        _ => {}
    }
    let first = text.as_bytes().first()?;
    let second = text.as_bytes().get(1);
    let looks_numeric = first.is_ascii_digit()
        || (*first == b'-' && second.is_some_and(|b| b.is_ascii_digit() || *b == b'.'))
        || (*first == b'.' && second.is_some_and(|b| b.is_ascii_digit()));
    if !looks_numeric {
        return None;
    }
    text.parse::<f64>().ok()
}

/// Serializes the tree. The output reparses to an equal tree; comments are
/// emitted as `;` lines preceding their node.
pub fn unparse(node: &Sexpr) -> String {
    let mut out = String::new();
    write_node(node, &mut out);
    out
}

fn write_node(node: &Sexpr, out: &mut String) {
    if let Some(comment) = &node.comment {
        for line in comment.lines() {
            out.push(';');
            if !line.is_empty() {
                out.push(' ');
                out.push_str(line);
            }
            out.push('\n');
        }
    }
    for label in &node.labels {
        out.push('#');
        out.push_str(label);
        out.push(' ');
    }
    if node.concurrent {
        out.push_str("||");
    }

    match &node.kind {
        SexprKind::Number(value) => out.push_str(&format_number(*value)),
        SexprKind::StringLit(value) => write_string(value, out),
        SexprKind::Symbol(name) => out.push_str(name),
        SexprKind::Op { opcode, children } => {
            out.push('(');
            out.push_str(opcode);
            for child in children {
                out.push(' ');
                write_node(child, out);
            }
            out.push(')');
        }
    }
}

fn write_string(value: &str, out: &mut String) {
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('"');
}
