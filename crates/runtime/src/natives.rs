//! Builtin native functions
//!
//! The global namespace carries exactly one native: `clock()`.

use std::time::{SystemTime, UNIX_EPOCH};

use lox_core::Value;

/// Seconds since the Unix epoch, as a Lox number.
pub fn clock(_args: &[Value]) -> Value {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Value::Number(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_a_positive_number() {
        match clock(&[]) {
            Value::Number(n) => assert!(n > 0.0),
            other => panic!("expected a number, got {other:?}"),
        }
    }

    #[test]
    fn test_clock_is_monotonic_enough() {
        let a = clock(&[]).as_number().unwrap();
        let b = clock(&[]).as_number().unwrap();
        assert!(b >= a);
    }
}
