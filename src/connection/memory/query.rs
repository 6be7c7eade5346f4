//! Filter evaluation, ordering and projection for the in-process server

use std::cmp::Ordering;

use mongodb::bson::{Bson, Document};

use crate::error::{CollectionError, Result};

/// Check whether `doc` satisfies `filter`.
pub(super) fn matches(doc: &Document, filter: &Document) -> Result<bool> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => logical(doc, condition)?.iter().all(|m| *m),
            "$or" => logical(doc, condition)?.iter().any(|m| *m),
            "$nor" => !logical(doc, condition)?.iter().any(|m| *m),
            op if op.starts_with('$') => {
                return Err(bad_value(format!("unknown top level operator: {op}")));
            }
            path => field_matches(get_path(doc, path), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn logical(doc: &Document, clauses: &Bson) -> Result<Vec<bool>> {
    match clauses {
        Bson::Array(items) if !items.is_empty() => items
            .iter()
            .map(|item| match item {
                Bson::Document(clause) => matches(doc, clause),
                _ => Err(bad_value("logical operator entries must be objects")),
            })
            .collect(),
        _ => Err(bad_value("logical operator requires a non-empty array")),
    }
}

fn is_operator_document(condition: &Bson) -> bool {
    match condition {
        Bson::Document(d) => !d.is_empty() && d.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn field_matches(value: Option<&Bson>, condition: &Bson) -> Result<bool> {
    if !is_operator_document(condition) {
        return Ok(equals(value, condition));
    }
    let Bson::Document(operators) = condition else {
        return Ok(false);
    };

    for (op, operand) in operators {
        let ok = match op.as_str() {
            "$eq" => equals(value, operand),
            "$ne" => !equals(value, operand),
            "$gt" => compares(value, operand, |o| o == Ordering::Greater),
            "$gte" => compares(value, operand, |o| o != Ordering::Less),
            "$lt" => compares(value, operand, |o| o == Ordering::Less),
            "$lte" => compares(value, operand, |o| o != Ordering::Greater),
            "$in" => in_set(value, operand)?,
            "$nin" => !in_set(value, operand)?,
            "$exists" => value.is_some() == truthy(operand),
            other => return Err(bad_value(format!("unknown operator: {other}"))),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Equality with array membership and missing-equals-null semantics.
fn equals(value: Option<&Bson>, expected: &Bson) -> bool {
    match value {
        None => matches!(expected, Bson::Null),
        Some(Bson::Array(items)) if !matches!(expected, Bson::Array(_)) => {
            items.iter().any(|item| compare_bson(item, expected) == Ordering::Equal)
        }
        Some(actual) => compare_bson(actual, expected) == Ordering::Equal,
    }
}

fn compares(value: Option<&Bson>, operand: &Bson, accept: impl Fn(Ordering) -> bool) -> bool {
    match value {
        Some(actual) if same_class(actual, operand) => accept(compare_bson(actual, operand)),
        _ => false,
    }
}

fn in_set(value: Option<&Bson>, operand: &Bson) -> Result<bool> {
    match operand {
        Bson::Array(candidates) => Ok(candidates.iter().any(|c| equals(value, c))),
        _ => Err(bad_value("$in/$nin needs an array")),
    }
}

fn same_class(a: &Bson, b: &Bson) -> bool {
    (is_number(a) && is_number(b)) || type_rank(a) == type_rank(b)
}

pub(super) fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Int32(v) => *v != 0,
        Bson::Int64(v) => *v != 0,
        Bson::Double(v) => *v != 0.0,
        Bson::Null | Bson::Undefined => false,
        _ => true,
    }
}

/// Resolve a dotted path through nested documents.
pub(super) fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut current = doc;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        let value = current.get(part)?;
        if parts.peek().is_none() {
            return Some(value);
        }
        match value {
            Bson::Document(next) => current = next,
            _ => return None,
        }
    }
    None
}

fn is_number(value: &Bson) -> bool {
    matches!(value, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_))
}

fn as_f64(value: &Bson) -> f64 {
    match value {
        Bson::Int32(v) => f64::from(*v),
        Bson::Int64(v) => *v as f64,
        Bson::Double(v) => *v,
        _ => f64::NAN,
    }
}

/// Total order over values: numbers compare numerically across types,
/// otherwise values of different types order by type rank.
pub(super) fn compare_bson(a: &Bson, b: &Bson) -> Ordering {
    if is_number(a) && is_number(b) {
        return as_f64(a).total_cmp(&as_f64(b));
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
        (Bson::Array(x), Bson::Array(y)) => compare_seq(x.iter(), y.iter()),
        (Bson::Document(x), Bson::Document(y)) => x
            .keys()
            .cmp(y.keys())
            .then_with(|| compare_seq(x.values(), y.values())),
        (Bson::Null, Bson::Null) | (Bson::MinKey, Bson::MinKey) | (Bson::MaxKey, Bson::MaxKey) => {
            Ordering::Equal
        }
        _ if type_rank(a) == type_rank(b) => a.to_string().cmp(&b.to_string()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn compare_seq<'a>(
    mut a: impl Iterator<Item = &'a Bson>,
    mut b: impl Iterator<Item = &'a Bson>,
) -> Ordering {
    loop {
        match (a.next(), b.next()) {
            (Some(x), Some(y)) => match compare_bson(x, y) {
                Ordering::Equal => continue,
                other => return other,
            },
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (None, None) => return Ordering::Equal,
        }
    }
}

/// Server sort order of BSON types.
fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::Symbol(_) | Bson::String(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::DbPointer(_) => 12,
        Bson::JavaScriptCode(_) => 13,
        Bson::JavaScriptCodeWithScope(_) => 14,
        Bson::MaxKey => 15,
    }
}

/// Stable sort by a sort specification such as `{ qty: -1, _id: 1 }`.
pub(super) fn sort_documents(documents: &mut [Document], sort: &Document) -> Result<()> {
    let mut keys = Vec::with_capacity(sort.len());
    for (field, direction) in sort {
        let descending = match direction {
            Bson::Int32(-1) | Bson::Int64(-1) => true,
            Bson::Int32(1) | Bson::Int64(1) => false,
            Bson::Double(d) if *d == -1.0 => true,
            Bson::Double(d) if *d == 1.0 => false,
            _ => return Err(bad_value(format!("bad sort direction for '{field}'"))),
        };
        keys.push((field.as_str(), descending));
    }

    documents.sort_by(|a, b| {
        for (field, descending) in &keys {
            let ordering = match (get_path(a, field), get_path(b, field)) {
                (Some(x), Some(y)) => compare_bson(x, y),
                (Some(x), None) => compare_bson(x, &Bson::Null),
                (None, Some(y)) => compare_bson(&Bson::Null, y),
                (None, None) => Ordering::Equal,
            };
            if ordering != Ordering::Equal {
                return if *descending { ordering.reverse() } else { ordering };
            }
        }
        Ordering::Equal
    });
    Ok(())
}

/// Apply an inclusion or exclusion projection.
pub(super) fn project(doc: &Document, projection: &Document) -> Result<Document> {
    if projection.is_empty() {
        return Ok(doc.clone());
    }

    let include_id = projection.get("_id").map(truthy).unwrap_or(true);
    let fields: Vec<(&String, bool)> = projection
        .iter()
        .filter(|(k, _)| k.as_str() != "_id")
        .map(|(k, v)| (k, truthy(v)))
        .collect();

    let inclusive = fields.iter().any(|(_, on)| *on);
    if inclusive && fields.iter().any(|(_, on)| !*on) {
        return Err(bad_value("projection cannot mix inclusion and exclusion"));
    }

    if inclusive {
        let mut out = Document::new();
        if include_id {
            if let Some(id) = doc.get("_id") {
                out.insert("_id", id.clone());
            }
        }
        for (field, _) in fields {
            if let Some(value) = doc.get(field) {
                out.insert(field.clone(), value.clone());
            }
        }
        Ok(out)
    } else {
        let mut out = doc.clone();
        for (field, _) in fields {
            out.remove(field);
        }
        if !include_id {
            out.remove("_id");
        }
        Ok(out)
    }
}

fn bad_value(message: impl Into<String>) -> CollectionError {
    CollectionError::command(2, message)
}
