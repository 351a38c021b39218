//! Densely-orderable position keys for sibling ordering.
//!
//! A key is a non-empty string over a base-62 alphabet, read as a fraction
//! in (0, 1): `"V"` ≈ 0.5, `"8"` ≈ 0.13, `"zV"` ≈ 0.99. Comparing keys is
//! plain byte order, and between any two distinct keys another key always
//! exists, so a card can be dropped between two neighbors without
//! renumbering any other sibling.
//!
//! ## Gap exhaustion
//!
//! A midpoint insert grows the new key by at most one digit over its longer
//! neighbor. To keep adversarial "insert into the same gap forever" from
//! hitting that one-digit-per-insert worst case on every step, wide gaps are
//! split with randomized jitter around the midpoint instead of a fixed
//! midpoint digit, which spreads consecutive inserts across fresh sub-gaps.
//! There is no global rebalancing, ever: keys only grow, roughly one digit
//! per ~5 inserts into one gap, and nothing outside the gap is touched.
//!
//! Floating-point fractional ordering (midpoint of two f64s) runs out of
//! precision after ~50 splits of one gap and then needs a rebalance pass
//! over every sibling; digit strings never do.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered alphabet for key digits. ASCII order: '0' < '9' < 'A' < 'Z' < 'a' < 'z'.
const DIGITS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const BASE: usize = DIGITS.len();

/// A sortable position key. Byte-wise `Ord` equals sibling display order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PositionKey(String);

/// Malformed or inverted neighbor bounds handed to the allocator.
///
/// Callers recover by re-fetching the current neighbors and retrying once;
/// a second violation fails the originating intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderingViolation {
    /// `lower >= upper` — the caller's view of the siblings is stale or corrupt.
    InvertedBounds { lower: String, upper: String },
    /// Empty key, digit outside the alphabet, or trailing minimal digit.
    MalformedKey(String),
}

impl fmt::Display for OrderingViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvertedBounds { lower, upper } => {
                write!(f, "inverted bounds: {lower:?} >= {upper:?}")
            }
            Self::MalformedKey(key) => write!(f, "malformed position key: {key:?}"),
        }
    }
}

impl std::error::Error for OrderingViolation {}

impl PositionKey {
    /// Produce a key strictly between the given neighbors.
    ///
    /// `None` means "no neighbor on that side": `(None, None)` allocates the
    /// first key of an empty parent, `(Some(a), None)` appends after the last
    /// sibling, `(None, Some(b))` inserts before the first.
    pub fn between(
        lower: Option<&PositionKey>,
        upper: Option<&PositionKey>,
    ) -> Result<PositionKey, OrderingViolation> {
        if let Some(key) = lower {
            validate(key.as_str())?;
        }
        if let Some(key) = upper {
            validate(key.as_str())?;
        }
        if let (Some(a), Some(b)) = (lower, upper) {
            if a >= b {
                return Err(OrderingViolation::InvertedBounds {
                    lower: a.to_string(),
                    upper: b.to_string(),
                });
            }
        }

        let key = match (lower, upper) {
            // Append after the last sibling: cheap successor, no length growth
            // until a digit position is exhausted.
            (Some(a), None) => successor(a.as_str()),
            (a, b) => midpoint(
                a.map(PositionKey::as_str).unwrap_or(""),
                b.map(PositionKey::as_str).unwrap_or(""),
            ),
        };

        debug_assert!(validate(&key).is_ok());
        Ok(PositionKey(key))
    }

    /// Parse an externally supplied key, rejecting malformed input.
    pub fn parse(raw: impl Into<String>) -> Result<PositionKey, OrderingViolation> {
        let raw = raw.into();
        validate(&raw)?;
        Ok(PositionKey(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn digit_value(byte: u8) -> Option<usize> {
    match byte {
        b'0'..=b'9' => Some((byte - b'0') as usize),
        b'A'..=b'Z' => Some((byte - b'A') as usize + 10),
        b'a'..=b'z' => Some((byte - b'a') as usize + 36),
        _ => None,
    }
}

fn digit_char(value: usize) -> char {
    DIGITS[value] as char
}

fn validate(key: &str) -> Result<(), OrderingViolation> {
    let bytes = key.as_bytes();
    if bytes.is_empty() || bytes.iter().any(|&b| digit_value(b).is_none()) {
        return Err(OrderingViolation::MalformedKey(key.to_string()));
    }
    // A trailing minimal digit denotes the same fraction as the key without
    // it, which would make the key impossible to insert before.
    if bytes[bytes.len() - 1] == b'0' {
        return Err(OrderingViolation::MalformedKey(key.to_string()));
    }
    Ok(())
}

/// Smallest-effort key strictly greater than `a`: bump the first non-maximal
/// digit and drop the rest. Key length only grows once every digit of `a`
/// is maximal, so append-at-end stays short under sustained use.
fn successor(a: &str) -> String {
    for (i, &byte) in a.as_bytes().iter().enumerate() {
        let value = digit_value(byte).unwrap_or(BASE - 1);
        if value < BASE - 1 {
            let mut key = a[..i].to_string();
            key.push(digit_char(value + 1));
            return key;
        }
    }
    let mut key = a.to_string();
    key.push(digit_char(BASE / 2));
    key
}

/// Key strictly between fractions `a` and `b`, where `""` means 0.0 as a
/// lower bound and 1.0 as an upper bound. Requires `a < b` when both are
/// non-empty (checked by the caller).
fn midpoint(a: &str, b: &str) -> String {
    if !b.is_empty() {
        // Shared prefix is kept verbatim; the split happens at the first
        // position where the bounds diverge ("" on the short side reads as
        // an implicit run of minimal digits).
        let a_bytes = a.as_bytes();
        let b_bytes = b.as_bytes();
        let mut n = 0;
        while n < b_bytes.len() && a_bytes.get(n).copied().unwrap_or(b'0') == b_bytes[n] {
            n += 1;
        }
        if n > 0 {
            let a_rest = if n <= a.len() { &a[n..] } else { "" };
            return format!("{}{}", &b[..n], midpoint(a_rest, &b[n..]));
        }
    }

    let digit_a = a
        .as_bytes()
        .first()
        .and_then(|&b| digit_value(b))
        .unwrap_or(0);
    let digit_b = b
        .as_bytes()
        .first()
        .and_then(|&b| digit_value(b))
        .unwrap_or(BASE);

    if digit_b - digit_a > 1 {
        return digit_char(split_gap(digit_a, digit_b)).to_string();
    }

    // Consecutive digits: no room at this position.
    if b.len() > 1 {
        // b's own first digit sits strictly inside the gap.
        return b[..1].to_string();
    }
    let a_rest = if a.is_empty() { "" } else { &a[1..] };
    format!("{}{}", digit_char(digit_a), midpoint(a_rest, ""))
}

/// Pick a split digit strictly inside `(lo, hi)`, jittered across the middle
/// half of the gap so repeated inserts into one gap land in fresh sub-gaps.
fn split_gap(lo: usize, hi: usize) -> usize {
    let span = hi - lo;
    if span == 2 {
        return lo + 1;
    }
    let min = (lo + span / 4).max(lo + 1);
    let max = (hi - span / 4).min(hi - 1);
    if min >= max {
        lo + span / 2
    } else {
        rand::thread_rng().gen_range(min..=max)
    }
}

// ===================================================================
// Tests
// ===================================================================
