//! Update operators for the in-process server

use mongodb::bson::{Bson, Document};

use crate::error::{CollectionError, Result};

use super::query::get_path;

/// Apply an operator update or a replacement to `doc`.
///
/// A replacement keeps the original `_id`. Returns true when the document
/// changed.
pub(super) fn apply(doc: &mut Document, update: &Document) -> Result<bool> {
    let before = doc.clone();

    if is_replacement(update) {
        let id = doc.get("_id").cloned();
        if let (Some(old), Some(new)) = (&id, update.get("_id")) {
            if old != new {
                return Err(CollectionError::command(66, "the _id field cannot be changed"));
            }
        }
        let mut replacement = Document::new();
        if let Some(id) = id {
            replacement.insert("_id", id);
        }
        for (key, value) in update {
            if key != "_id" {
                replacement.insert(key.clone(), value.clone());
            }
        }
        *doc = replacement;
        return Ok(*doc != before);
    }

    for (op, fields) in update {
        let Bson::Document(fields) = fields else {
            return Err(CollectionError::command(9, format!("{op} needs an object")));
        };
        for (path, value) in fields {
            if path == "_id" || path.starts_with("_id.") {
                return Err(CollectionError::command(66, "the _id field cannot be changed"));
            }
            match op.as_str() {
                "$set" => set_path(doc, path, value.clone())?,
                "$unset" => unset_path(doc, path),
                "$inc" => {
                    let current = get_path(doc, path).cloned();
                    set_path(doc, path, increment(current.as_ref(), value)?)?;
                }
                other => {
                    return Err(CollectionError::command(
                        9,
                        format!("unknown update operator: {other}"),
                    ));
                }
            }
        }
    }
    Ok(*doc != before)
}

pub(super) fn is_replacement(update: &Document) -> bool {
    update.keys().all(|k| !k.starts_with('$'))
}

/// Seed document for an upsert: the plain equality fields of the query.
pub(super) fn upsert_seed(criteria: &Document) -> Document {
    let mut seed = Document::new();
    for (key, value) in criteria {
        if key.starts_with('$') || key.contains('.') {
            continue;
        }
        match value {
            Bson::Document(d) if d.keys().any(|k| k.starts_with('$')) => {}
            other => {
                seed.insert(key.clone(), other.clone());
            }
        }
    }
    seed
}

fn increment(current: Option<&Bson>, by: &Bson) -> Result<Bson> {
    let sum = match (current, by) {
        (None, v @ (Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_))) => v.clone(),
        (Some(Bson::Int32(a)), Bson::Int32(b)) => match a.checked_add(*b) {
            Some(v) => Bson::Int32(v),
            None => Bson::Int64(i64::from(*a) + i64::from(*b)),
        },
        (Some(Bson::Int32(a)), Bson::Int64(b)) => Bson::Int64(i64::from(*a) + b),
        (Some(Bson::Int64(a)), Bson::Int32(b)) => Bson::Int64(a + i64::from(*b)),
        (Some(Bson::Int64(a)), Bson::Int64(b)) => Bson::Int64(a + b),
        (Some(Bson::Double(a)), Bson::Double(b)) => Bson::Double(a + b),
        (Some(Bson::Double(a)), Bson::Int32(b)) => Bson::Double(a + f64::from(*b)),
        (Some(Bson::Double(a)), Bson::Int64(b)) => Bson::Double(a + *b as f64),
        (Some(Bson::Int32(a)), Bson::Double(b)) => Bson::Double(f64::from(*a) + b),
        (Some(Bson::Int64(a)), Bson::Double(b)) => Bson::Double(*a as f64 + b),
        _ => {
            return Err(CollectionError::command(
                14,
                "cannot apply $inc to a non-numeric value",
            ));
        }
    };
    Ok(sum)
}

fn set_path(doc: &mut Document, path: &str, value: Bson) -> Result<()> {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            if !doc.contains_key(head) {
                doc.insert(head, Document::new());
            }
            match doc.get_mut(head) {
                Some(Bson::Document(child)) => set_path(child, rest, value),
                _ => Err(CollectionError::command(
                    28,
                    format!("cannot create field '{rest}' inside non-object '{head}'"),
                )),
            }
        }
    }
}

fn unset_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(child)) = doc.get_mut(head) {
                unset_path(child, rest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    #[test]
    fn test_operators() {
        let mut d = doc! { "_id": 1, "qty": 1, "meta": { "a": 1 } };
        let changed = apply(
            &mut d,
            &doc! { "$inc": { "qty": 2 }, "$set": { "meta.b": "x" }, "$unset": { "meta.a": "" } },
        )
        .unwrap();
        assert!(changed);
        assert_eq!(d, doc! { "_id": 1, "qty": 3, "meta": { "b": "x" } });
    }

    #[test]
    fn test_replacement_keeps_id() {
        let mut d = doc! { "_id": 7, "a": 1 };
        apply(&mut d, &doc! { "b": 2 }).unwrap();
        assert_eq!(d, doc! { "_id": 7, "b": 2 });
        assert!(apply(&mut d, &doc! { "_id": 8 }).is_err());
    }

    #[test]
    fn test_unchanged_reports_false() {
        let mut d = doc! { "_id": 1, "a": 1 };
        assert!(!apply(&mut d, &doc! { "$set": { "a": 1 } }).unwrap());
    }

    #[test]
    fn test_inc_rejects_strings() {
        let mut d = doc! { "a": "x" };
        assert!(apply(&mut d, &doc! { "$inc": { "a": 1 } }).is_err());
    }

    #[test]
    fn test_upsert_seed() {
        let seed = upsert_seed(&doc! { "sku": "a", "qty": { "$gt": 1 }, "$or": [], "x.y": 1 });
        assert_eq!(seed, doc! { "sku": "a" });
    }
}
