//! In-process evaluation of the Elasticsearch query DSL subset that saved
//! searches use.
//!
//! Supported clauses: `match_all`, `term`, `terms`, `match`, `match_phrase`,
//! `query_string`, `simple_query_string`, `bool`, `range`, `exists`, and
//! `constant_score`. Unknown clauses never match. Text matching is a plain
//! lowercase token comparison, not an analyzer.

use serde_json::{Map, Value};

use crate::models::parse_es_date;

/// Whether `source` satisfies `query`.
pub fn matches(query: &Value, source: &Value) -> bool {
    let Some(clause) = query.as_object() else {
        return false;
    };
    clause.iter().all(|(kind, body)| matches_clause(kind, body, source))
}

fn matches_clause(kind: &str, body: &Value, source: &Value) -> bool {
    match kind {
        "match_all" => true,
        "match_none" => false,
        "term" => field_clause(body, source, "value", |values, expected| {
            values.iter().any(|v| values_equal(v, expected))
        }),
        "terms" => single_field(body).is_some_and(|(field, expected)| {
            let values = field_values(source, field);
            expected
                .as_array()
                .is_some_and(|wanted| wanted.iter().any(|e| values.iter().any(|v| values_equal(v, e))))
        }),
        "match" => field_clause(body, source, "query", |values, expected| {
            let wanted = tokens(&scalar_text(expected));
            let have: Vec<String> = values.iter().flat_map(|v| tokens(&scalar_text(v))).collect();
            wanted.iter().any(|w| have.contains(w))
        }),
        "match_phrase" => field_clause(body, source, "query", |values, expected| {
            let phrase = tokens(&scalar_text(expected)).join(" ");
            values
                .iter()
                .any(|v| tokens(&scalar_text(v)).join(" ").contains(&phrase))
        }),
        "query_string" | "simple_query_string" => query_string(body, source),
        "bool" => body.as_object().is_some_and(|b| bool_query(b, source)),
        "range" => single_field(body).is_some_and(|(field, bounds)| {
            field_values(source, field).iter().any(|v| in_range(v, bounds))
        }),
        "exists" => body
            .get("field")
            .and_then(Value::as_str)
            .is_some_and(|field| field_values(source, field).iter().any(|v| !v.is_null())),
        "constant_score" => body.get("filter").is_some_and(|f| matches(f, source)),
        _ => false,
    }
}

/// Clause of the form `{field: value}` or `{field: {<key>: value}}`.
fn field_clause(
    body: &Value,
    source: &Value,
    key: &str,
    check: impl Fn(&[&Value], &Value) -> bool,
) -> bool {
    single_field(body).is_some_and(|(field, spec)| {
        let expected = spec.get(key).unwrap_or(spec);
        check(&field_values(source, field), expected)
    })
}

fn single_field(body: &Value) -> Option<(&str, &Value)> {
    let obj = body.as_object()?;
    obj.iter()
        .find(|(k, _)| !k.starts_with('_') && k.as_str() != "boost")
        .map(|(k, v)| (k.as_str(), v))
}

fn bool_query(body: &Map<String, Value>, source: &Value) -> bool {
    let clauses = |name: &str| -> Vec<&Value> {
        match body.get(name) {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(other) => vec![other],
            None => Vec::new(),
        }
    };
    let must = clauses("must");
    let filter = clauses("filter");
    let should = clauses("should");
    let must_not = clauses("must_not");

    if !must.iter().chain(filter.iter()).all(|q| matches(q, source)) {
        return false;
    }
    if must_not.iter().any(|q| matches(q, source)) {
        return false;
    }
    let required = body
        .get("minimum_should_match")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .unwrap_or(if must.is_empty() && filter.is_empty() && !should.is_empty() {
            1
        } else {
            0
        });
    should.iter().filter(|q| matches(q, source)).count() >= required
}

fn query_string(body: &Value, source: &Value) -> bool {
    let Some(text) = body.get("query").and_then(Value::as_str) else {
        return false;
    };
    let require_all = body
        .get("default_operator")
        .and_then(Value::as_str)
        .is_some_and(|op| op.eq_ignore_ascii_case("and"));

    let terms: Vec<String> = text
        .split_whitespace()
        .filter(|t| !matches!(*t, "AND" | "OR"))
        .flat_map(tokens)
        .collect();
    if terms.is_empty() {
        return true;
    }

    let haystack: Vec<String> = match body.get("fields").and_then(Value::as_array) {
        Some(fields) => fields
            .iter()
            .filter_map(Value::as_str)
            .flat_map(|f| field_values(source, f.split('^').next().unwrap_or(f)))
            .flat_map(|v| tokens(&scalar_text(v)))
            .collect(),
        None => all_strings(source).iter().flat_map(|s| tokens(s)).collect(),
    };

    if require_all {
        terms.iter().all(|t| haystack.contains(t))
    } else {
        terms.iter().any(|t| haystack.contains(t))
    }
}

fn in_range(value: &Value, bounds: &Value) -> bool {
    let Some(bounds) = bounds.as_object() else {
        return false;
    };
    let Some(actual) = comparable(value) else {
        return false;
    };
    bounds.iter().all(|(op, limit)| {
        let Some(limit) = comparable(limit) else {
            // Unknown keys like `format` do not constrain the match.
            return !matches!(op.as_str(), "gt" | "gte" | "lt" | "lte");
        };
        match op.as_str() {
            "gt" => actual > limit,
            "gte" => actual >= limit,
            "lt" => actual < limit,
            "lte" => actual <= limit,
            _ => true,
        }
    })
}

/// Numbers compare as-is; strings compare as dates (epoch millis).
fn comparable(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_es_date(s).map(|ms| ms as f64),
        _ => None,
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::String(a), Value::String(b)) => a == b,
        (Value::String(a), other) | (other, Value::String(a)) => a == &other.to_string(),
        (a, b) => a == b,
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn all_strings(value: &Value) -> Vec<&str> {
    match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().flat_map(all_strings).collect(),
        Value::Object(map) => map.values().flat_map(all_strings).collect(),
        _ => Vec::new(),
    }
}

/// Leaf values at a dotted path, flattening arrays along the way.
///
/// A trailing `.keyword` sub-field resolves to its parent.
pub fn field_values<'a>(source: &'a Value, path: &str) -> Vec<&'a Value> {
    let path = path.strip_suffix(".keyword").unwrap_or(path);
    let mut current = vec![source];
    for part in path.split('.') {
        current = current
            .into_iter()
            .flat_map(|v| match v {
                Value::Array(items) => items.iter().collect::<Vec<_>>(),
                other => vec![other],
            })
            .filter_map(|v| v.get(part))
            .collect();
    }
    current
        .into_iter()
        .flat_map(|v| match v {
            Value::Array(items) => items.iter().collect::<Vec<_>>(),
            other => vec![other],
        })
        .collect()
}
