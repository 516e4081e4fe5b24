//! Total order over JSON values and documents.
//!
//! Kinds rank `null < bool < number < string < array < object`; within a kind
//! values compare naturally. Documents compare by each ordering field in turn,
//! then by id, so every result set has one stable order and a cursor taken
//! from any document identifies a unique resume point.

use std::cmp::Ordering;

use serde_json::Value;

use crate::document::{Document, DOCUMENT_ID_FIELD};
use super::builder::{Direction, OrderBy};
use super::cursor::CursorPosition;

fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            match (x.as_i64(), y.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => {
                    let x = x.as_f64().unwrap_or(f64::NAN);
                    let y = y.as_f64().unwrap_or(f64::NAN);
                    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
                }
            }
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                let ord = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => kind_rank(a).cmp(&kind_rank(b)),
    }
}

/// Value a document sorts by for `field`. Missing fields sort as null.
pub fn sort_value(doc: &Document, field: &str) -> Value {
    if field == DOCUMENT_ID_FIELD {
        return Value::String(doc.id.clone());
    }
    doc.field(field).cloned().unwrap_or(Value::Null)
}

fn directed(ord: Ordering, direction: Direction) -> Ordering {
    match direction {
        Direction::Asc => ord,
        Direction::Desc => ord.reverse(),
    }
}

pub fn compare_documents(a: &Document, b: &Document, order_by: &[OrderBy]) -> Ordering {
    for order in order_by {
        let ord = compare_values(&sort_value(a, &order.field), &sort_value(b, &order.field));
        let ord = directed(ord, order.direction);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.id.cmp(&b.id)
}

/// Where `doc` sits relative to a cursor position under `order_by`.
pub fn compare_to_position(doc: &Document, position: &CursorPosition, order_by: &[OrderBy]) -> Ordering {
    for (order, anchor) in order_by.iter().zip(position.sort_values.iter()) {
        let ord = directed(compare_values(&sort_value(doc, &order.field), anchor), order.direction);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    doc.id.as_str().cmp(position.document_id.as_str())
}

/// Cursor position of `doc` under `order_by`.
pub fn position_of(doc: &Document, order_by: &[OrderBy]) -> CursorPosition {
    CursorPosition {
        sort_values: order_by.iter().map(|o| sort_value(doc, &o.field)).collect(),
        document_id: doc.id.clone(),
    }
}
