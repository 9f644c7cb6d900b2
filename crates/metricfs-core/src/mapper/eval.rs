//! Per-record evaluation of a selected rule into candidate keys.
//!
//! A record is parsed as a JSON document; pointers (RFC 6901, `/`-rooted
//! for the document, `./`-rooted for array items) pull values into the
//! canonical template, fallback pointers fill placeholders the primary
//! resolution left open, and the rendered id is normalized into a
//! [`CandidateKey`]. A record that fails to parse yields no candidates,
//! which downstream treats as deny.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;

use super::{MapperError, MapperSpec, NormalizeSpec, SelectedRule};
use crate::authz::CandidateKey;

/// Evaluates one record against the selected rule.
///
/// Returns the deduplicated candidate list in first-occurrence order. An
/// unparseable record returns an empty list rather than an error.
///
/// # Errors
///
/// Returns a [`MapperError`] for rule-level configuration problems only:
/// malformed pointer syntax or an unsupported mapper kind.
pub fn evaluate_line(rule: &SelectedRule, line: &[u8]) -> Result<Vec<CandidateKey>, MapperError> {
    let Ok(doc) = serde_json::from_slice::<Value>(line) else {
        return Ok(Vec::new());
    };

    let spec = &rule.rule.mapper;
    let mut out = Vec::new();
    match spec.kind.as_str() {
        "json_pointer" => {
            if !spec.pointer.starts_with('/') {
                return Err(MapperError::RootPointerSyntax {
                    pointer: spec.pointer.clone(),
                });
            }
            let Some(value) = doc.pointer(&spec.pointer).and_then(value_to_string) else {
                return Ok(Vec::new());
            };
            let mut values = BTreeMap::new();
            values.insert("value".to_string(), value);
            if let Some(candidate) = build_candidate(
                &doc,
                spec,
                &rule.rule.object_type,
                &rule.rule.permission,
                &spec.canonical_template,
                &values,
            ) {
                out.push(candidate);
            } else {
                return Ok(Vec::new());
            }
        }
        "multi_extract" => {
            for emit in &spec.emit {
                if let Some(from_array) = &emit.from_array {
                    let Some(items) = resolve_root(&doc, &from_array.pointer)
                        .and_then(Value::as_array)
                    else {
                        continue;
                    };
                    for item in items {
                        let mut values = BTreeMap::new();
                        for (name, pointer) in &from_array.fields {
                            let Some(rest) = pointer.strip_prefix("./") else {
                                return Err(MapperError::ItemPointerSyntax {
                                    pointer: pointer.clone(),
                                });
                            };
                            let resolved = if rest.is_empty() {
                                value_to_string(item)
                            } else {
                                item.pointer(&format!("/{rest}")).and_then(value_to_string)
                            };
                            let Some(value) = resolved else {
                                break;
                            };
                            values.insert(name.clone(), value);
                        }
                        if let Some(candidate) = build_candidate(
                            &doc,
                            spec,
                            &emit.object_type,
                            &emit.permission,
                            &from_array.canonical_template,
                            &values,
                        ) {
                            out.push(candidate);
                        }
                    }
                } else {
                    let mut values = BTreeMap::new();
                    for (name, pointer) in &emit.fields {
                        if !pointer.starts_with('/') {
                            return Err(MapperError::RootPointerSyntax {
                                pointer: pointer.clone(),
                            });
                        }
                        // An unresolved field stops primary extraction;
                        // the open placeholder may still be filled by a
                        // fallback pointer at render time.
                        let Some(value) = doc.pointer(pointer).and_then(value_to_string) else {
                            break;
                        };
                        values.insert(name.clone(), value);
                    }
                    if let Some(candidate) = build_candidate(
                        &doc,
                        spec,
                        &emit.object_type,
                        &emit.permission,
                        &emit.canonical_template,
                        &values,
                    ) {
                        out.push(candidate);
                    }
                }
            }
        }
        other => {
            return Err(MapperError::UnsupportedMapperKind {
                kind: other.to_string(),
            });
        }
    }

    Ok(dedup_candidates(out))
}

/// Renders the template with the resolved values, fills remaining
/// placeholders from the fallback pointers, and normalizes the result into
/// a candidate. Returns `None` when a placeholder stays unresolved or the
/// rendered id is empty.
fn build_candidate(
    doc: &Value,
    spec: &MapperSpec,
    object_type: &str,
    permission: &str,
    template: &str,
    values: &BTreeMap<String, String>,
) -> Option<CandidateKey> {
    let mut rendered = template.to_string();
    for (name, value) in values {
        rendered = rendered.replace(&format!("{{{name}}}"), value);
    }

    for (name, pointers) in &spec.fallback_paths {
        let needle = format!("{{{name}}}");
        if !rendered.contains(&needle) {
            continue;
        }
        for pointer in pointers {
            let Some(value) = resolve_root(doc, pointer).and_then(value_to_string) else {
                continue;
            };
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                rendered = rendered.replace(&needle, trimmed);
                break;
            }
        }
    }

    if rendered.contains('{') || rendered.contains('}') {
        return None;
    }

    let mut id = rendered;
    // Defensive against templates that already include the type.
    if let Some(stripped) = id.strip_prefix(&format!("{object_type}:")) {
        id = stripped.to_string();
    }
    id = apply_normalize(&id, spec.normalize);
    if id.is_empty() {
        return None;
    }

    Some(CandidateKey::new(object_type, id, permission))
}

fn apply_normalize(id: &str, normalize: NormalizeSpec) -> String {
    let mut out = id.to_string();
    if normalize.lowercase {
        out = out.to_lowercase();
    }
    if normalize.trim_slash {
        out = out.trim_matches('/').to_string();
    }
    out
}

/// Resolves a `/`-rooted pointer against the document. A pointer without
/// the leading `/` is simply unresolved here; syntax enforcement happens
/// where the rule demands it.
fn resolve_root<'doc>(doc: &'doc Value, pointer: &str) -> Option<&'doc Value> {
    if !pointer.starts_with('/') {
        return None;
    }
    doc.pointer(pointer)
}

/// Textual form of a scalar: integers in plain decimal, strings verbatim,
/// booleans as `true`/`false`. Null is unresolved. Containers render as
/// compact JSON.
fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).ok(),
    }
}

fn dedup_candidates(candidates: Vec<CandidateKey>) -> Vec<CandidateKey> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|candidate| seen.insert(candidate.clone()))
        .collect()
}
