//! Tolerant readers for free-form provider responses. Every entry point
//! returns `Result<_, ParseError>`; callers decide what the fallback is.

use std::collections::BTreeSet;

use foldwise_llm::ProviderDescriptor;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::records::TypeToProviderMap;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty response")]
    Empty,
    #[error("no structured payload found")]
    NoPayload,
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("invalid payload: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAnalysis {
    pub proposed_name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub garbage: bool,
}

/// Returns the contents of the first fenced code block, or failing that the
/// span from the first `{` to the last `}`.
pub fn extract_json_block(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            let block = body[..end].trim();
            if !block.is_empty() {
                return Some(block);
            }
        }
    }
    let open = text.find('{')?;
    let close = text.rfind('}')?;
    (close > open).then(|| &text[open..=close])
}

fn structured_object(text: &str) -> Option<Map<String, Value>> {
    let candidates = [extract_json_block(text), Some(text.trim())];
    candidates
        .into_iter()
        .flatten()
        .find_map(|candidate| match serde_json::from_str::<Value>(candidate) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        })
}

fn first_string(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| map.get(*k))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn split_tags(raw: &str) -> Vec<String> {
    raw.split([',', ';'])
        .map(|t| t.trim().trim_matches('"').trim_start_matches('#').trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn tags_of(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        Some(Value::String(raw)) => split_tags(raw),
        _ => Vec::new(),
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.trim().to_lowercase().as_str(), "true" | "yes" | "1"),
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        _ => false,
    }
}

fn clean_name(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .trim()
        .to_string()
}

pub fn parse_analysis(text: &str) -> Result<ParsedAnalysis, ParseError> {
    if text.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    if let Some(map) = structured_object(text) {
        return analysis_from_object(&map);
    }
    analysis_from_lines(text)
}

fn analysis_from_object(map: &Map<String, Value>) -> Result<ParsedAnalysis, ParseError> {
    let proposed_name = first_string(map, &["proposed_name", "name", "filename", "title"])
        .map(|n| clean_name(&n))
        .filter(|n| !n.is_empty())
        .ok_or(ParseError::MissingField("proposed_name"))?;
    let tags = tags_of(map.get("tags"));
    let garbage = truthy(map.get("garbage"))
        || tags.iter().any(|t| t.eq_ignore_ascii_case("garbage"));
    Ok(ParsedAnalysis {
        proposed_name,
        description: first_string(map, &["description", "summary"]).unwrap_or_default(),
        tags,
        garbage,
    })
}

fn analysis_from_lines(text: &str) -> Result<ParsedAnalysis, ParseError> {
    let mut name = None;
    let mut description = None;
    let mut tags = Vec::new();
    let mut garbage = false;
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key
            .trim()
            .trim_start_matches(['-', '*', ' '])
            .to_lowercase()
            .replace(' ', "_");
        let value = value.trim();
        match key.as_str() {
            "name" | "proposed_name" | "filename" | "new_name" => {
                name = Some(clean_name(value));
            }
            "description" | "summary" => description = Some(value.to_string()),
            "tags" | "keywords" => {
                tags = split_tags(value.trim_start_matches('[').trim_end_matches(']'))
            }
            "garbage" => garbage = truthy(Some(&Value::String(value.to_string()))),
            _ => {}
        }
    }
    let Some(proposed_name) = name.filter(|n| !n.is_empty()) else {
        return Err(ParseError::NoPayload);
    };
    garbage |= tags.iter().any(|t| t.eq_ignore_ascii_case("garbage"));
    Ok(ParsedAnalysis {
        proposed_name,
        description: description.unwrap_or_default(),
        tags,
        garbage,
    })
}

/// Reads `{content_type: provider}` (optionally under a `mapping` key).
/// Providers may be named in full (`ollama/llava`) or by bare model id;
/// unknown providers and content types not in `content_types` are dropped.
pub fn parse_type_mapping(
    text: &str,
    content_types: &BTreeSet<String>,
    providers: &[ProviderDescriptor],
) -> Result<TypeToProviderMap, ParseError> {
    if text.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    let mut map = structured_object(text).ok_or(ParseError::NoPayload)?;
    if let Some(Value::Object(inner)) = map.remove("mapping") {
        map = inner;
    }
    let primaries: BTreeSet<&str> = content_types
        .iter()
        .map(|t| crate::content::primary_type(t))
        .collect();
    let mut out = TypeToProviderMap::default();
    for (content_type, value) in &map {
        let Some(raw) = value.as_str() else {
            continue;
        };
        let wanted = content_types.contains(content_type)
            || content_type
                .strip_suffix("/*")
                .is_some_and(|p| primaries.contains(p));
        if !wanted {
            continue;
        }
        let raw = raw.trim();
        let found = providers
            .iter()
            .find(|p| p.name == raw)
            .or_else(|| providers.iter().find(|p| p.model == raw));
        if let Some(provider) = found {
            out.insert(content_type.clone(), provider.name.clone());
        }
    }
    if out.is_empty() {
        return Err(ParseError::Invalid(
            "no usable content-type assignments".to_string(),
        ));
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedCategory {
    pub path: String,
    pub label: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedAssignment {
    pub file: String,
    pub category: String,
    pub filename: Option<String>,
    pub reasoning: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaxonomyProposal {
    pub categories: Vec<ProposedCategory>,
    pub assignments: Vec<ProposedAssignment>,
}

/// Reads `{"taxonomy": [...], "assignments": [...]}`. Nested `children` are
/// flattened; a child path without `/` is taken relative to its parent.
pub fn parse_taxonomy_response(text: &str) -> Result<TaxonomyProposal, ParseError> {
    if text.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    let map = structured_object(text).ok_or(ParseError::NoPayload)?;
    let mut proposal = TaxonomyProposal::default();
    let nodes = map
        .get("taxonomy")
        .or_else(|| map.get("categories"))
        .and_then(Value::as_array);
    for node in nodes.into_iter().flatten() {
        flatten_category(node, None, &mut proposal.categories);
    }
    let assignments = map
        .get("assignments")
        .and_then(Value::as_array)
        .ok_or(ParseError::MissingField("assignments"))?;
    for item in assignments {
        let Value::Object(entry) = item else {
            continue;
        };
        let (Some(file), Some(category)) = (
            first_string(entry, &["file", "path", "source"]),
            first_string(entry, &["category", "category_path", "target_category_path", "target"]),
        ) else {
            continue;
        };
        proposal.assignments.push(ProposedAssignment {
            file,
            category,
            filename: first_string(entry, &["filename", "proposed_filename", "name"]),
            reasoning: first_string(entry, &["reasoning", "reason"]).unwrap_or_default(),
        });
    }
    if proposal.assignments.is_empty() {
        return Err(ParseError::Invalid("no assignments".to_string()));
    }
    Ok(proposal)
}

fn flatten_category(node: &Value, parent: Option<&str>, out: &mut Vec<ProposedCategory>) {
    let Value::Object(map) = node else {
        return;
    };
    let Some(raw_path) = first_string(map, &["path", "name", "label"]) else {
        return;
    };
    let path = match parent {
        Some(parent) if !raw_path.contains('/') => format!("{parent}/{raw_path}"),
        _ => raw_path,
    };
    out.push(ProposedCategory {
        label: first_string(map, &["label", "name"]).unwrap_or_default(),
        description: first_string(map, &["description"]).unwrap_or_default(),
        path: path.clone(),
    });
    if let Some(Value::Array(children)) = map.get("children") {
        for child in children {
            flatten_category(child, Some(&path), out);
        }
    }
}
