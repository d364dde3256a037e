//! Node-spec grammar and edge text tokenizer

use std::sync::LazyLock;

use regex::Regex;

use crate::error::ValidationError;
use crate::model::Literal;

/// Unquoted names must not start with whitespace, parens, a quote or `?`.
static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s()'?]").expect("name pattern is valid"));

static ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?\d+$").expect("id pattern is valid"));

/// What a textual node reference denotes.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeSpec {
    /// Lookup of an existing node by id.
    Id(u64),
    /// A value node. Never stored.
    Literal(Literal),
    /// Empty spec: a fresh anonymous node.
    Anonymous,
    Name(String),
}

/// Parse one node reference.
pub fn parse_node_spec(spec: &str) -> Result<NodeSpec, ValidationError> {
    if spec.is_empty() {
        return Ok(NodeSpec::Anonymous);
    }
    if let Some(body) = spec.strip_prefix('"') {
        return parse_quoted(spec, body).map(|s| NodeSpec::Literal(Literal::Str(s)));
    }
    if ID_PATTERN.is_match(spec) {
        // Out-of-range and negative ids cannot name a stored node
        return spec
            .trim_start_matches('+')
            .parse::<u64>()
            .map(NodeSpec::Id)
            .map_err(|_| ValidationError::InvalidName(spec.to_string()));
    }
    if let Some(body) = spec.strip_prefix('\'') {
        return parse_primitive(body).map(NodeSpec::Literal);
    }
    if is_valid_name(spec) {
        return Ok(NodeSpec::Name(spec.to_string()));
    }
    Err(ValidationError::InvalidName(spec.to_string()))
}

/// Whether `name` may be used as an unquoted node name.
pub fn is_valid_name(name: &str) -> bool {
    NAME_PATTERN.is_match(name)
}

fn parse_quoted(spec: &str, body: &str) -> Result<String, ValidationError> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => out.push(escaped),
                None => return Err(ValidationError::UnterminatedString(spec.to_string())),
            },
            '"' => {
                if chars.next().is_some() {
                    return Err(ValidationError::InvalidName(spec.to_string()));
                }
                return Ok(out);
            }
            other => out.push(other),
        }
    }
    Err(ValidationError::UnterminatedString(spec.to_string()))
}

fn parse_primitive(body: &str) -> Result<Literal, ValidationError> {
    match body {
        "true" | "T" => return Ok(Literal::Bool(true)),
        "false" | "F" => return Ok(Literal::Bool(false)),
        _ => {}
    }
    if let Ok(int) = body.parse::<i64>() {
        return Ok(Literal::Int(int));
    }
    match body.parse::<f64>() {
        Ok(float) if float.is_finite() => Ok(Literal::Float(float)),
        _ => Err(ValidationError::InvalidPrimitive(body.to_string())),
    }
}

/// Split a parenthesised edge into its argument tokens. Whitespace inside a
/// quoted string or a nested parenthesised group does not split.
pub fn split_edge(text: &str) -> Result<Vec<String>, ValidationError> {
    let trimmed = text.trim();
    let inner = trimmed
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| ValidationError::Unbalanced(text.to_string()))?;

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut escaped = false;

    for c in inner.chars() {
        if in_quote {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_quote = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_quote = true;
                current.push(c);
            }
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| ValidationError::Unbalanced(text.to_string()))?;
                current.push(c);
            }
            c if c.is_whitespace() && depth == 0 => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }

    if in_quote {
        return Err(ValidationError::UnterminatedString(text.to_string()));
    }
    if depth != 0 {
        return Err(ValidationError::Unbalanced(text.to_string()));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}
