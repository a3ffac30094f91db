use crate::core::error::AppError;
use crate::core::flow_graph::context::{is_truthy, lookup_path, stringify};
use crate::core::types::ErrorCategory;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::{json, Map, Value};
use std::collections::HashSet;

/// Compiled message template. Syntax is the `{{ variable.path|filter }}`
/// family with `{% if %}`/`{% for %}` blocks. Rendering never fails: missing
/// keys produce the empty string, so a stale optional variable can never
/// block message delivery. Malformed syntax is a compile-time error instead.
#[derive(Debug, Clone)]
pub struct Template {
    nodes: Vec<Node>,
}

#[derive(Debug, Clone)]
enum Node {
    Text(String),
    Var {
        path: String,
        filters: Vec<Filter>,
    },
    If {
        path: String,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
    For {
        var: String,
        path: String,
        body: Vec<Node>,
    },
}

#[derive(Debug, Clone)]
enum Filter {
    Title,
    Upper,
    Lower,
    Replace { from: String, to: String },
    Date { format: String },
}

#[derive(Debug)]
enum Token {
    Text(String),
    Var(String),
    Tag(String),
}

impl Template {
    pub fn compile(source: &str) -> Result<Template, AppError> {
        let tokens = lex(source)?;
        let mut iter = tokens.into_iter().peekable();
        let (nodes, terminator) = parse_block(&mut iter, &[])?;
        if let Some(tag) = terminator {
            return Err(template_error(format!("unexpected '{{% {} %}}'", tag)));
        }
        Ok(Template { nodes })
    }

    pub fn render(&self, context: &Value) -> String {
        let mut out = String::new();
        render_nodes(&self.nodes, context, &mut out);
        out
    }

    /// Root context variables the template reads, excluding names bound by
    /// enclosing `{% for %}` blocks. Used by declared-variable validation.
    pub fn referenced_variables(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        collect_vars(&self.nodes, &HashSet::new(), &mut seen, &mut out);
        out
    }
}

/// Compile-and-render convenience for one-shot template strings.
pub fn render_str(source: &str, context: &Value) -> Result<String, AppError> {
    Ok(Template::compile(source)?.render(context))
}

fn template_error(message: impl Into<String>) -> AppError {
    AppError::new(ErrorCategory::TemplateError, message).with_code("FLOW-TPL-001")
}

fn lex(source: &str) -> Result<Vec<Token>, AppError> {
    let mut tokens = Vec::new();
    let mut rest = source;
    loop {
        let var_at = rest.find("{{");
        let tag_at = rest.find("{%");
        let (at, is_var) = match (var_at, tag_at) {
            (None, None) => {
                if !rest.is_empty() {
                    tokens.push(Token::Text(rest.to_string()));
                }
                return Ok(tokens);
            }
            (Some(v), None) => (v, true),
            (None, Some(t)) => (t, false),
            (Some(v), Some(t)) => {
                if v < t {
                    (v, true)
                } else {
                    (t, false)
                }
            }
        };
        if at > 0 {
            tokens.push(Token::Text(rest[..at].to_string()));
        }
        let open = if is_var { "{{" } else { "{%" };
        let close = if is_var { "}}" } else { "%}" };
        let after_open = &rest[at + open.len()..];
        let end = after_open
            .find(close)
            .ok_or_else(|| template_error(format!("unclosed '{}' in template", open)))?;
        let inner = after_open[..end].trim().to_string();
        if inner.is_empty() {
            return Err(template_error(format!("empty '{}' expression", open)));
        }
        tokens.push(if is_var {
            Token::Var(inner)
        } else {
            Token::Tag(inner)
        });
        rest = &after_open[end + close.len()..];
    }
}

fn parse_block(
    tokens: &mut std::iter::Peekable<std::vec::IntoIter<Token>>,
    terminators: &[&str],
) -> Result<(Vec<Node>, Option<String>), AppError> {
    let mut nodes = Vec::new();
    while let Some(token) = tokens.next() {
        match token {
            Token::Text(text) => nodes.push(Node::Text(text)),
            Token::Var(expr) => nodes.push(parse_var(&expr)?),
            Token::Tag(tag) => {
                let mut words = tag.split_whitespace();
                let keyword = words.next().unwrap_or_default().to_string();
                if terminators.contains(&keyword.as_str()) {
                    return Ok((nodes, Some(keyword)));
                }
                match keyword.as_str() {
                    "if" => {
                        let path: String = words.collect::<Vec<_>>().join(" ");
                        if path.is_empty() {
                            return Err(template_error("'{% if %}' requires a variable path"));
                        }
                        let (then, term) = parse_block(tokens, &["else", "endif"])?;
                        let otherwise = match term.as_deref() {
                            Some("else") => {
                                let (otherwise, term) = parse_block(tokens, &["endif"])?;
                                if term.as_deref() != Some("endif") {
                                    return Err(template_error("unclosed '{% if %}' block"));
                                }
                                otherwise
                            }
                            Some("endif") => Vec::new(),
                            _ => return Err(template_error("unclosed '{% if %}' block")),
                        };
                        nodes.push(Node::If {
                            path,
                            then,
                            otherwise,
                        });
                    }
                    "for" => {
                        let parts: Vec<&str> = words.collect();
                        if parts.len() != 3 || parts[1] != "in" {
                            return Err(template_error(
                                "'{% for %}' must be '{% for item in path %}'",
                            ));
                        }
                        let (body, term) = parse_block(tokens, &["endfor"])?;
                        if term.as_deref() != Some("endfor") {
                            return Err(template_error("unclosed '{% for %}' block"));
                        }
                        nodes.push(Node::For {
                            var: parts[0].to_string(),
                            path: parts[2].to_string(),
                            body,
                        });
                    }
                    other => {
                        return Err(template_error(format!("unknown tag '{{% {} %}}'", other)));
                    }
                }
            }
        }
    }
    if terminators.is_empty() {
        Ok((nodes, None))
    } else {
        Err(template_error(format!(
            "missing closing tag, expected one of {:?}",
            terminators
        )))
    }
}

fn parse_var(expr: &str) -> Result<Node, AppError> {
    let mut parts = expr.split('|');
    let path = parts
        .next()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| template_error("empty variable expression"))?
        .to_string();
    let mut filters = Vec::new();
    for part in parts {
        filters.push(parse_filter(part.trim())?);
    }
    Ok(Node::Var { path, filters })
}

fn parse_filter(spec: &str) -> Result<Filter, AppError> {
    let (name, args_raw) = match spec.split_once(':') {
        Some((name, args)) => (name.trim(), Some(args.trim())),
        None => (spec, None),
    };
    let args: Vec<String> = args_raw
        .map(|raw| {
            raw.split(',')
                .map(|arg| arg.trim().trim_matches('"').to_string())
                .collect()
        })
        .unwrap_or_default();
    match name {
        "title" => Ok(Filter::Title),
        "upper" => Ok(Filter::Upper),
        "lower" => Ok(Filter::Lower),
        "replace" => {
            if args.len() != 2 {
                return Err(template_error("replace filter takes two arguments"));
            }
            Ok(Filter::Replace {
                from: args[0].clone(),
                to: args[1].clone(),
            })
        }
        "date" => {
            if args.len() != 1 {
                return Err(template_error("date filter takes one format argument"));
            }
            Ok(Filter::Date {
                format: args[0].clone(),
            })
        }
        other => Err(template_error(format!("unknown filter '{}'", other))),
    }
}

fn render_nodes(nodes: &[Node], context: &Value, out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Var { path, filters } => {
                let mut text = lookup_path(context, path)
                    .map(stringify)
                    .unwrap_or_default();
                for filter in filters {
                    text = filter.apply(&text);
                }
                out.push_str(&text);
            }
            Node::If {
                path,
                then,
                otherwise,
            } => {
                let truthy = lookup_path(context, path).map(is_truthy).unwrap_or(false);
                render_nodes(if truthy { then } else { otherwise }, context, out);
            }
            Node::For { var, path, body } => {
                let items = match lookup_path(context, path) {
                    Some(Value::Array(items)) => items.clone(),
                    _ => continue,
                };
                let total = items.len();
                for (index, item) in items.into_iter().enumerate() {
                    let mut scope = match context {
                        Value::Object(map) => map.clone(),
                        _ => Map::new(),
                    };
                    scope.insert(var.clone(), item);
                    scope.insert(
                        "loop".to_string(),
                        json!({
                            "index": index + 1,
                            "first": index == 0,
                            "last": index + 1 == total,
                        }),
                    );
                    render_nodes(body, &Value::Object(scope), out);
                }
            }
        }
    }
}

impl Filter {
    fn apply(&self, text: &str) -> String {
        match self {
            Filter::Title => title_case(text),
            Filter::Upper => text.to_uppercase(),
            Filter::Lower => text.to_lowercase(),
            Filter::Replace { from, to } => text.replace(from.as_str(), to.as_str()),
            Filter::Date { format } => format_date(text, format),
        }
    }
}

fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut at_word_start = true;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            if at_word_start {
                out.extend(ch.to_uppercase());
            } else {
                out.extend(ch.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(ch);
            at_word_start = true;
        }
    }
    out
}

/// Format a timestamp-ish string. Unparseable input passes through unchanged
/// rather than breaking the message.
fn format_date(text: &str, format: &str) -> String {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return dt.format(format).to_string();
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return dt.format(format).to_string();
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date.format(format).to_string();
    }
    text.to_string()
}

fn collect_vars(
    nodes: &[Node],
    bound: &HashSet<String>,
    seen: &mut HashSet<String>,
    out: &mut Vec<String>,
) {
    for node in nodes {
        match node {
            Node::Text(_) => {}
            Node::Var { path, .. } => record_var(path, bound, seen, out),
            Node::If {
                path,
                then,
                otherwise,
            } => {
                record_var(path, bound, seen, out);
                collect_vars(then, bound, seen, out);
                collect_vars(otherwise, bound, seen, out);
            }
            Node::For { var, path, body } => {
                record_var(path, bound, seen, out);
                let mut inner = bound.clone();
                inner.insert(var.clone());
                collect_vars(body, &inner, seen, out);
            }
        }
    }
}

fn record_var(
    path: &str,
    bound: &HashSet<String>,
    seen: &mut HashSet<String>,
    out: &mut Vec<String>,
) {
    let root = path.split('.').next().unwrap_or(path).to_string();
    if root == "loop" || bound.contains(&root) {
        return;
    }
    if seen.insert(root.clone()) {
        out.push(root);
    }
}
