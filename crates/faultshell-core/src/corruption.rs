/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Type-preserving corruption of structured payloads.
//!
//! Exactly one leaf field (string, number or boolean) inside an object or
//! array is altered: strings are reversed, numbers nudged by a bounded delta,
//! booleans flipped. Top-level scalars are never touched.

use rand::Rng;
use serde_json::{Number, Value};

/// Largest absolute delta applied to an integer field.
const MAX_INTEGER_DELTA: i64 = 10;
/// Largest relative change applied to a float field.
const MAX_FLOAT_RATIO: f64 = 0.25;

#[derive(Debug, Clone, PartialEq)]
pub struct Corruption {
    /// JSON pointer of the altered field.
    pub path: String,
    pub detail: String,
}

impl std::fmt::Display for Corruption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.path, self.detail)
    }
}

/// Corrupt one leaf of `value` in place. Returns `None` when the payload is a
/// scalar or has no corruptible leaves.
pub fn corrupt_value<R: Rng + ?Sized>(value: &mut Value, rng: &mut R) -> Option<Corruption> {
    if !matches!(value, Value::Object(_) | Value::Array(_)) {
        return None;
    }
    let mut candidates = Vec::new();
    collect_leaves(value, String::new(), &mut candidates);
    if candidates.is_empty() {
        return None;
    }
    let path = candidates.swap_remove(rng.gen_range(0..candidates.len()));
    let leaf = value.pointer_mut(&path)?;
    let detail = mutate_leaf(leaf, rng)?;
    Some(Corruption { path, detail })
}

/// Parse `raw` as JSON and corrupt it; `None` for non-structured text.
pub fn corrupt_json_text<R: Rng + ?Sized>(raw: &str, rng: &mut R) -> Option<(String, Corruption)> {
    let mut value: Value = serde_json::from_str(raw).ok()?;
    let corruption = corrupt_value(&mut value, rng)?;
    let text = serde_json::to_string(&value).ok()?;
    Some((text, corruption))
}

fn collect_leaves(value: &Value, path: String, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                collect_leaves(child, format!("{path}/{}", escape_pointer(key)), out);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                collect_leaves(child, format!("{path}/{index}"), out);
            }
        }
        // Reversing a palindrome (or an empty string) would change nothing.
        Value::String(text) if text.chars().rev().eq(text.chars()) => {}
        Value::String(_) | Value::Number(_) | Value::Bool(_) => out.push(path),
        Value::Null => {}
    }
}

fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

fn mutate_leaf<R: Rng + ?Sized>(leaf: &mut Value, rng: &mut R) -> Option<String> {
    match leaf {
        Value::String(text) => {
            let reversed = text.chars().rev().collect::<String>();
            *text = reversed;
            Some("string reversed".to_string())
        }
        Value::Bool(flag) => {
            *flag = !*flag;
            Some(format!("boolean flipped to {flag}"))
        }
        Value::Number(number) => {
            let (replacement, detail) = perturb_number(number, rng)?;
            *number = replacement;
            Some(detail)
        }
        _ => None,
    }
}

fn perturb_number<R: Rng + ?Sized>(number: &Number, rng: &mut R) -> Option<(Number, String)> {
    let magnitude = rng.gen_range(1..=MAX_INTEGER_DELTA);
    let delta = if rng.gen_bool(0.5) { magnitude } else { -magnitude };
    if let Some(value) = number.as_i64() {
        // At either bound the shift goes the other way.
        let (next, delta) = match value.checked_add(delta) {
            Some(next) => (next, delta),
            None => (value - delta, -delta),
        };
        return Some((Number::from(next), format!("integer shifted by {delta}")));
    }
    if let Some(value) = number.as_u64() {
        let step = delta.unsigned_abs();
        let (next, delta) = match value.checked_add(step) {
            Some(next) if delta >= 0 => (next, delta),
            _ => (value - step, -delta.abs()),
        };
        return Some((Number::from(next), format!("integer shifted by {delta}")));
    }
    let value = number.as_f64()?;
    let mut ratio = rng.gen_range(-MAX_FLOAT_RATIO..MAX_FLOAT_RATIO);
    let mut next = if value == 0.0 { ratio } else { value * (1.0 + ratio) };
    if next == value {
        ratio = MAX_FLOAT_RATIO;
        next = if value == 0.0 { ratio } else { value * (1.0 + ratio) };
    }
    Number::from_f64(next).map(|n| (n, format!("float scaled by {:+.1}%", ratio * 100.0)))
}
