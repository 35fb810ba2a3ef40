//! Minimal Kubernetes quantity arithmetic for memory sizes.
//!
//! Accepts binary (`Ki`..`Ei`), decimal (`k`..`E`) and exponent (`1e9`)
//! suffixes. Values are whole bytes; fractional results round up.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::error::{Error, Result};

const BINARY: [(&str, u32); 6] = [("Ki", 1), ("Mi", 2), ("Gi", 3), ("Ti", 4), ("Pi", 5), ("Ei", 6)];
const DECIMAL: [(&str, u32); 6] = [("k", 1), ("M", 2), ("G", 3), ("T", 4), ("P", 5), ("E", 6)];

fn invalid(value: &str, reason: &str) -> Error {
    Error::Quantity { value: value.to_string(), reason: reason.to_string() }
}

/// Parse a quantity into bytes.
pub fn to_bytes(q: &Quantity) -> Result<u128> {
    parse(q.0.trim())
}

fn parse(s: &str) -> Result<u128> {
    if s.is_empty() { return Err(invalid(s, "empty")); }
    if s.starts_with('-') { return Err(invalid(s, "negative")); }
    let s_num = s.strip_prefix('+').unwrap_or(s);

    // Split numeric part and suffix
    let split = s_num
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s_num.len());
    let (num, suffix) = s_num.split_at(split);
    if num.is_empty() { return Err(invalid(s, "missing digits")); }

    let (mult_num, mult_den): (u128, u128) = if suffix.is_empty() {
        (1, 1)
    } else if let Some((_, p)) = BINARY.iter().find(|(sfx, _)| *sfx == suffix) {
        (1u128 << (10 * p), 1)
    } else if let Some((_, p)) = DECIMAL.iter().find(|(sfx, _)| *sfx == suffix) {
        (10u128.pow(*p * 3), 1)
    } else if suffix == "m" {
        (1, 1000)
    } else if let Some(exp) = suffix.strip_prefix('e').or_else(|| suffix.strip_prefix('E')) {
        let e: u32 = exp.parse().map_err(|_| invalid(s, "bad exponent"))?;
        if e > 30 { return Err(invalid(s, "exponent too large")); }
        (10u128.pow(e), 1)
    } else {
        return Err(invalid(s, "unknown suffix"));
    };

    let (int_part, frac_part) = match num.split_once('.') {
        Some((i, f)) => (i, f),
        None => (num, ""),
    };
    if frac_part.contains('.') { return Err(invalid(s, "multiple decimal points")); }
    if frac_part.len() > 18 { return Err(invalid(s, "too many fractional digits")); }
    let digits = format!("{}{}", int_part, frac_part);
    let mantissa: u128 = if digits.is_empty() { 0 } else { digits.parse().map_err(|_| invalid(s, "not a number"))? };
    let scale = 10u128.pow(frac_part.len() as u32);

    let numer = mantissa.checked_mul(mult_num).ok_or_else(|| invalid(s, "overflow"))?;
    let denom = scale * mult_den;
    Ok(numer.div_ceil(denom))
}

/// Render bytes with the largest binary suffix that divides them exactly.
pub fn from_bytes(bytes: u128) -> Quantity {
    if bytes == 0 { return Quantity("0".to_string()); }
    for (sfx, p) in BINARY.iter().rev() {
        let unit = 1u128 << (10 * p);
        if bytes % unit == 0 {
            return Quantity(format!("{}{}", bytes / unit, sfx));
        }
    }
    Quantity(bytes.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity { Quantity(s.to_string()) }

    #[test]
    fn parses_suffixes() {
        assert_eq!(to_bytes(&q("1Gi")).unwrap(), 1 << 30);
        assert_eq!(to_bytes(&q("512Mi")).unwrap(), 512 << 20);
        assert_eq!(to_bytes(&q("1G")).unwrap(), 1_000_000_000);
        assert_eq!(to_bytes(&q("1.5Gi")).unwrap(), 3 << 29);
        assert_eq!(to_bytes(&q("2e3")).unwrap(), 2000);
        assert_eq!(to_bytes(&q("1024")).unwrap(), 1024);
    }

    #[test]
    fn rejects_garbage() {
        assert!(to_bytes(&q("")).is_err());
        assert!(to_bytes(&q("-1Gi")).is_err());
        assert!(to_bytes(&q("1Zi")).is_err());
        assert!(to_bytes(&q("Gi")).is_err());
    }

    #[test]
    fn rounds_up_near_the_top_of_the_range() {
        assert_eq!(to_bytes(&q("340282366920938463463374607431768211.455")).unwrap(), u128::MAX.div_ceil(1000));
        assert_eq!(to_bytes(&q("1500m")).unwrap(), 2);
    }

    #[test]
    fn formats_largest_exact_unit() {
        assert_eq!(from_bytes(1 << 30).0, "1Gi");
        assert_eq!(from_bytes(768 << 20).0, "768Mi");
        assert_eq!(from_bytes(1000).0, "1000");
    }
}
