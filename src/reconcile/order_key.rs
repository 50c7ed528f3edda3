//! Fractional order keys.
//!
//! A key is an integer part followed by an optional fraction, both written in
//! base62 digits ordered `0-9A-Za-z` (which is also their ASCII order).
//!
//! The first character of the integer part is a head that encodes how many
//! digits follow: `a` is one digit, `b` two, up to `z`; `Z` is one digit of a
//! negative integer, `Y` two, down to `A`. Longer integers therefore sort
//! after shorter ones and plain lexicographic comparison of the strings is
//! numeric comparison of the keys. The fraction `0.d1 d2 ...` never ends in
//! `0`, since `"a0V"` and `"a0V0"` would leave no room between them.
//!
//! Appending at either end steps the integer part, so a long run of tail
//! appends grows keys with `log(n)`. Allocation between two neighbours
//! bisects the fraction and never re-keys them.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const DIGITS: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const BASE: usize = DIGITS.len();

/// Integer part of the first key allocated into an empty sequence.
const INTEGER_ZERO: &str = "a0";
/// Smallest integer part; usable only with a fraction.
const SMALLEST_INTEGER: &str = "A00000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("Invalid key bounds: '{lower}' is not below '{upper}'")]
    InvalidBounds { lower: String, upper: String },
    #[error("Malformed order key: {0:?}")]
    MalformedKey(String),
    #[error("Order key space exhausted next to '{0}'")]
    Exhausted(String),
}

/// Opaque, totally ordered position token.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrderKey(String);

impl OrderKey {
    /// Validates a key read from storage or the wire.
    pub fn parse(raw: &str) -> Result<Self, AllocationError> {
        let malformed = || AllocationError::MalformedKey(raw.to_string());
        if !raw.bytes().all(|b| digit_value(b).is_some()) || raw == SMALLEST_INTEGER {
            return Err(malformed());
        }
        let integer = integer_part(raw).ok_or_else(malformed)?;
        if raw[integer.len()..].ends_with('0') {
            return Err(malformed());
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for OrderKey {
    type Error = AllocationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<OrderKey> for String {
    fn from(key: OrderKey) -> Self {
        key.0
    }
}

/// Allocates `count` keys strictly between `lower` and `upper`.
///
/// A missing bound leaves that side open. The returned keys are strictly
/// increasing, so they preserve the order in which the caller assigns them.
///
/// # Errors
///
/// [`AllocationError::InvalidBounds`] when `lower >= upper`.
pub fn allocate(
    lower: Option<&OrderKey>,
    upper: Option<&OrderKey>,
    count: usize,
) -> Result<Vec<OrderKey>, AllocationError> {
    if let (Some(lower), Some(upper)) = (lower, upper) {
        if lower >= upper {
            return Err(AllocationError::InvalidBounds {
                lower: lower.0.clone(),
                upper: upper.0.clone(),
            });
        }
    }

    let mut keys = Vec::with_capacity(count);
    fill_between(
        lower.map(OrderKey::as_str),
        upper.map(OrderKey::as_str),
        count,
        &mut keys,
    )?;
    Ok(keys.into_iter().map(OrderKey).collect())
}

/// Convenience for a single key, e.g. a folder appended after `lower`.
pub fn allocate_one(
    lower: Option<&OrderKey>,
    upper: Option<&OrderKey>,
) -> Result<OrderKey, AllocationError> {
    let mut keys = allocate(lower, upper, 1)?;
    keys.pop().ok_or_else(|| AllocationError::MalformedKey(String::new()))
}

fn fill_between(
    lower: Option<&str>,
    upper: Option<&str>,
    count: usize,
    out: &mut Vec<String>,
) -> Result<(), AllocationError> {
    match (lower, upper, count) {
        (_, _, 0) => Ok(()),
        // Open-ended runs step the integer part one key at a time.
        (_, None, _) => {
            let mut prev = lower.map(str::to_string);
            for _ in 0..count {
                let next = key_between(prev.as_deref(), None)?;
                out.push(next.clone());
                prev = Some(next);
            }
            Ok(())
        }
        (None, Some(_), _) => {
            let start = out.len();
            let mut next_upper = upper.map(str::to_string);
            for _ in 0..count {
                let key = key_between(None, next_upper.as_deref())?;
                out.push(key.clone());
                next_upper = Some(key);
            }
            out[start..].reverse();
            Ok(())
        }
        (Some(_), Some(_), _) => {
            let mid = key_between(lower, upper)?;
            let before = count / 2;
            fill_between(lower, Some(&mid), before, out)?;
            out.push(mid.clone());
            fill_between(Some(&mid), upper, count - before - 1, out)
        }
    }
}

/// Single key strictly between two well-formed keys, `lower < upper`.
fn key_between(lower: Option<&str>, upper: Option<&str>) -> Result<String, AllocationError> {
    let malformed = |k: &str| AllocationError::MalformedKey(k.to_string());
    match (lower, upper) {
        (None, None) => Ok(INTEGER_ZERO.to_string()),
        (None, Some(upper)) => {
            let int_upper = integer_part(upper).ok_or_else(|| malformed(upper))?;
            let frac_upper = &upper[int_upper.len()..];
            if int_upper == SMALLEST_INTEGER {
                return Ok(format!("{int_upper}{}", midpoint("", Some(frac_upper))));
            }
            if int_upper.len() < upper.len() {
                return Ok(int_upper.to_string());
            }
            decrement_integer(int_upper).ok_or_else(|| AllocationError::Exhausted(upper.to_string()))
        }
        (Some(lower), None) => {
            let int_lower = integer_part(lower).ok_or_else(|| malformed(lower))?;
            let frac_lower = &lower[int_lower.len()..];
            Ok(increment_integer(int_lower)
                .unwrap_or_else(|| format!("{int_lower}{}", midpoint(frac_lower, None))))
        }
        (Some(lower), Some(upper)) => {
            let int_lower = integer_part(lower).ok_or_else(|| malformed(lower))?;
            let int_upper = integer_part(upper).ok_or_else(|| malformed(upper))?;
            let frac_lower = &lower[int_lower.len()..];
            if int_lower == int_upper {
                let frac_upper = &upper[int_upper.len()..];
                return Ok(format!("{int_lower}{}", midpoint(frac_lower, Some(frac_upper))));
            }
            let next = increment_integer(int_lower)
                .ok_or_else(|| AllocationError::Exhausted(lower.to_string()))?;
            if next.as_str() < upper {
                return Ok(next);
            }
            Ok(format!("{int_lower}{}", midpoint(frac_lower, None)))
        }
    }
}

/// Shortest fraction strictly between `lower` (`""` = 0) and `upper` (`None` = 1).
///
/// Requires `lower < upper` and neither ending in `0`.
fn midpoint(lower: &str, upper: Option<&str>) -> String {
    if let Some(upper) = upper {
        // Skip the shared prefix, reading `lower` as zero-padded.
        let lb = lower.as_bytes();
        let ub = upper.as_bytes();
        let mut n = 0;
        while n < ub.len() && lb.get(n).copied().unwrap_or(b'0') == ub[n] {
            n += 1;
        }
        if n > 0 {
            let lower_rest = lower.get(n..).unwrap_or("");
            return format!("{}{}", &upper[..n], midpoint(lower_rest, Some(&upper[n..])));
        }
    }

    let lo = lower.bytes().next().and_then(digit_value).unwrap_or(0);
    let hi = upper
        .and_then(|u| u.bytes().next())
        .and_then(digit_value)
        .unwrap_or(BASE);

    if hi - lo > 1 {
        return char::from(DIGITS[(lo + hi) / 2]).to_string();
    }

    match upper {
        // `upper[0]` alone sorts after `lower` (smaller first digit) and before `upper`.
        Some(upper) if upper.len() > 1 => upper[..1].to_string(),
        _ => {
            let rest = lower.get(1..).unwrap_or("");
            format!("{}{}", char::from(DIGITS[lo]), midpoint(rest, None))
        }
    }
}

/// Total length of an integer part, head included, from its head character.
fn integer_length(head: u8) -> Option<usize> {
    match head {
        b'a'..=b'z' => Some((head - b'a') as usize + 2),
        b'A'..=b'Z' => Some((b'Z' - head) as usize + 2),
        _ => None,
    }
}

fn integer_part(key: &str) -> Option<&str> {
    let len = integer_length(*key.as_bytes().first()?)?;
    key.get(..len)
}

/// Next integer part, or `None` past the largest (`z` followed by `z`s).
fn increment_integer(integer: &str) -> Option<String> {
    let (head, digits) = integer.as_bytes().split_first()?;
    let mut digits = digits.to_vec();
    let mut carry = true;
    for d in digits.iter_mut().rev() {
        let next = digit_value(*d)? + 1;
        if next == BASE {
            *d = b'0';
        } else {
            *d = DIGITS[next];
            carry = false;
            break;
        }
    }
    if carry {
        match *head {
            b'Z' => return Some(INTEGER_ZERO.to_string()),
            b'z' => return None,
            _ => {}
        }
        let head = head + 1;
        if head > b'a' {
            digits.push(b'0');
        } else {
            digits.pop();
        }
        return Some(integer_string(head, &digits));
    }
    Some(integer_string(*head, &digits))
}

/// Previous integer part, or `None` below the smallest.
fn decrement_integer(integer: &str) -> Option<String> {
    let (head, digits) = integer.as_bytes().split_first()?;
    let mut digits = digits.to_vec();
    let mut borrow = true;
    for d in digits.iter_mut().rev() {
        match digit_value(*d)? {
            0 => *d = DIGITS[BASE - 1],
            value => {
                *d = DIGITS[value - 1];
                borrow = false;
                break;
            }
        }
    }
    if borrow {
        match *head {
            b'a' => return Some(integer_string(b'Z', &[DIGITS[BASE - 1]])),
            b'A' => return None,
            _ => {}
        }
        let head = head - 1;
        if head < b'Z' {
            digits.push(DIGITS[BASE - 1]);
        } else {
            digits.pop();
        }
        return Some(integer_string(head, &digits));
    }
    Some(integer_string(*head, &digits))
}

fn integer_string(head: u8, digits: &[u8]) -> String {
    let mut s = String::with_capacity(digits.len() + 1);
    s.push(char::from(head));
    s.extend(digits.iter().map(|&d| char::from(d)));
    s
}

fn digit_value(b: u8) -> Option<usize> {
    match b {
        b'0'..=b'9' => Some((b - b'0') as usize),
        b'A'..=b'Z' => Some((b - b'A') as usize + 10),
        b'a'..=b'z' => Some((b - b'a') as usize + 36),
        _ => None,
    }
}
