//! Extractor evaluation against recorded responses.
//!
//! Every parse or match problem is returned as an [`ExtractionFailure`];
//! callers decide whether to fall back to a default.

use crate::error::ExtractionFailure;
use crate::model::{Extractor, ExtractorKind, ExtractorSource, ResponseInfo};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use sxd_document::dom::{ChildOfElement, ChildOfRoot, Document, Element};
use sxd_xpath::Value as XPathValue;

/// A `prefix:name` step. Axes (`child::`) do not match.
static PREFIXED_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^\w:.-])[A-Za-z_][\w.-]*:[A-Za-z_*]")
        .expect("failed to compile prefixed name regex")
});

/// Evaluate one extractor against a response.
pub fn evaluate(
    extractor: &Extractor,
    response: &ResponseInfo,
) -> Result<String, ExtractionFailure> {
    if extractor.source == ExtractorSource::Header {
        return extract_header(response, &extractor.path);
    }
    match extractor.kind {
        ExtractorKind::XPath => extract_xpath(&response.body, &extractor.path),
        ExtractorKind::Regex => extract_regex(&response.body, &extractor.path),
        ExtractorKind::JsonPath => extract_json_path(&response.body, &extractor.path),
        ExtractorKind::Header => extract_header(response, &extractor.path),
    }
}

/// String value of the first node (in document order) selected by
/// `xpath`, or the scalar result of the expression.
///
/// Without namespace prefixes in `xpath`, elements match on their local
/// name, so `//Name` finds `<m:Name>` inside a SOAP envelope.
pub fn extract_xpath(xml: &str, xpath: &str) -> Result<String, ExtractionFailure> {
    let package = sxd_document::parser::parse(xml)
        .map_err(|e| ExtractionFailure::InvalidXml(e.to_string()))?;
    let document = package.as_document();
    if !PREFIXED_NAME_RE.is_match(xpath) {
        strip_namespaces(&document);
    }

    let value = sxd_xpath::evaluate_xpath(&document, xpath).map_err(|e| {
        ExtractionFailure::InvalidExpression {
            expression: xpath.to_string(),
            reason: e.to_string(),
        }
    })?;

    match value {
        XPathValue::Nodeset(nodes) => nodes
            .document_order_first()
            .map(|node| node.string_value())
            .ok_or_else(|| ExtractionFailure::NoMatch(xpath.to_string())),
        XPathValue::String(s) => Ok(s),
        XPathValue::Number(n) => Ok(n.to_string()),
        XPathValue::Boolean(b) => Ok(b.to_string()),
    }
}

fn strip_namespaces(document: &Document<'_>) {
    for child in document.root().children() {
        if let ChildOfRoot::Element(element) = child {
            strip_element(element);
        }
    }
}

fn strip_element(element: Element<'_>) {
    let local = element.name().local_part().to_string();
    element.set_name(local.as_str());
    for child in element.children() {
        if let ChildOfElement::Element(nested) = child {
            strip_element(nested);
        }
    }
}

/// First capture group of the first match of `pattern` in `text`.
pub fn extract_regex(text: &str, pattern: &str) -> Result<String, ExtractionFailure> {
    let re = Regex::new(pattern).map_err(|e| ExtractionFailure::InvalidExpression {
        expression: pattern.to_string(),
        reason: e.to_string(),
    })?;

    if re.captures_len() < 2 {
        return Err(ExtractionFailure::NoCaptureGroup(pattern.to_string()));
    }

    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| ExtractionFailure::NoMatch(pattern.to_string()))
}

/// First value selected by `path`, coerced to a string. Strings are
/// returned unquoted; other values as compact JSON.
pub fn extract_json_path(body: &str, path: &str) -> Result<String, ExtractionFailure> {
    let json: Value = serde_json::from_str(body)
        .map_err(|e| ExtractionFailure::InvalidJson(e.to_string()))?;
    let segments = parse_json_path(path).map_err(|reason| {
        ExtractionFailure::InvalidExpression {
            expression: path.to_string(),
            reason,
        }
    })?;

    select(&json, &segments)
        .into_iter()
        .next()
        .map(json_to_string)
        .ok_or_else(|| ExtractionFailure::NoMatch(path.to_string()))
}

/// Case-insensitive header lookup by literal name.
pub fn extract_header(
    response: &ResponseInfo,
    name: &str,
) -> Result<String, ExtractionFailure> {
    response
        .headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name.trim()))
        .map(|(_, value)| value.clone())
        .ok_or_else(|| ExtractionFailure::MissingHeader(name.to_string()))
}

fn json_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Child(String),
    Index(i64),
    Wildcard,
    /// `..name`, or `..*` when `None`.
    Descendant(Option<String>),
}

/// Parse the supported JSONPath subset: `$`, `.name`, `['name']`,
/// `[n]` (negative counts from the end), `.*`, `[*]`, `..name`, `..*`.
/// A path without a leading `$` is read as a dotted path from the root.
fn parse_json_path(path: &str) -> Result<Vec<Segment>, String> {
    let trimmed = path.trim();
    let normalized = match trimmed.strip_prefix('$') {
        Some(rest) => rest.to_string(),
        None if trimmed.starts_with('.') || trimmed.starts_with('[') => {
            trimmed.to_string()
        }
        None => format!(".{trimmed}"),
    };

    let chars: Vec<char> = normalized.chars().collect();
    let mut segments = Vec::new();
    let mut i = 0;

    let read_name = |start: usize| -> (String, usize) {
        let mut end = start;
        while end < chars.len() && chars[end] != '.' && chars[end] != '[' {
            end += 1;
        }
        (chars[start..end].iter().collect(), end)
    };

    while i < chars.len() {
        match chars[i] {
            '.' if chars.get(i + 1) == Some(&'.') => {
                let (name, next) = read_name(i + 2);
                match name.as_str() {
                    "" => return Err("'..' must be followed by a name".to_string()),
                    "*" => segments.push(Segment::Descendant(None)),
                    _ => segments.push(Segment::Descendant(Some(name))),
                }
                i = next;
            }
            '.' => {
                let (name, next) = read_name(i + 1);
                match name.as_str() {
                    "" => return Err(format!("empty name at offset {i}")),
                    "*" => segments.push(Segment::Wildcard),
                    _ => segments.push(Segment::Child(name)),
                }
                i = next;
            }
            '[' => {
                let close = chars[i..]
                    .iter()
                    .position(|c| *c == ']')
                    .map(|offset| i + offset)
                    .ok_or_else(|| format!("unclosed '[' at offset {i}"))?;
                let inner: String = chars[i + 1..close].iter().collect();
                segments.push(parse_bracket(inner.trim())?);
                i = close + 1;
            }
            other => return Err(format!("unexpected '{other}' at offset {i}")),
        }
    }

    Ok(segments)
}

fn parse_bracket(inner: &str) -> Result<Segment, String> {
    if inner == "*" {
        return Ok(Segment::Wildcard);
    }
    for quote in ['\'', '"'] {
        if let Some(name) = inner
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return Ok(Segment::Child(name.to_string()));
        }
    }
    inner
        .parse::<i64>()
        .map(Segment::Index)
        .map_err(|_| format!("unsupported selector '[{inner}]'"))
}

fn select<'a>(root: &'a Value, segments: &[Segment]) -> Vec<&'a Value> {
    let mut nodes = vec![root];
    for segment in segments {
        let mut next = Vec::new();
        for node in nodes {
            match segment {
                Segment::Child(name) => {
                    if let Some(child) = node.get(name.as_str()) {
                        next.push(child);
                    }
                }
                Segment::Index(idx) => {
                    if let Value::Array(items) = node {
                        let resolved = if *idx < 0 {
                            items.len().checked_sub(idx.unsigned_abs() as usize)
                        } else {
                            Some(*idx as usize)
                        };
                        if let Some(item) = resolved.and_then(|i| items.get(i)) {
                            next.push(item);
                        }
                    }
                }
                Segment::Wildcard => match node {
                    Value::Object(map) => next.extend(map.values()),
                    Value::Array(items) => next.extend(items.iter()),
                    _ => {}
                },
                Segment::Descendant(name) => descend(node, name.as_deref(), &mut next),
            }
        }
        nodes = next;
    }
    nodes
}

fn descend<'a>(node: &'a Value, name: Option<&str>, out: &mut Vec<&'a Value>) {
    match node {
        Value::Object(map) => {
            for (key, value) in map {
                if name.map_or(true, |n| n == key) {
                    out.push(value);
                }
                descend(value, name, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                if name.is_none() {
                    out.push(item);
                }
                descend(item, name, out);
            }
        }
        _ => {}
    }
}
