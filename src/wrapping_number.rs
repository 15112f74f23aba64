use thiserror::Error;

/// Errors that can occur during wrapping number operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WrappingNumberError {
    /// Integer overflow occurred during wrapping difference calculation.
    /// This should be mathematically impossible with valid u16 inputs.
    #[error("Integer overflow in wrapping_diff({a}, {b}) - this should not happen")]
    IntegerOverflow { a: u16, b: u16 },
}

/// Returns whether or not a wrapping number is greater than another
/// sequence_greater_than(2,1) will return true
/// sequence_greater_than(1,2) will return false
/// sequence_greater_than(1,1) will return false
pub fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    ((s1 > s2) && (s1 - s2 <= 32768)) || ((s1 < s2) && (s2 - s1 > 32768))
}

/// Returns whether or not a wrapping number is less than another
/// sequence_less_than(1,2) will return true
/// sequence_less_than(2,1) will return false
/// sequence_less_than(1,1) will return false
pub fn sequence_less_than(s1: u16, s2: u16) -> bool {
    sequence_greater_than(s2, s1)
}

/// Retrieves the wrapping difference between 2 u16 values.
/// Returns an error if an impossible integer overflow occurs.
pub fn try_wrapping_diff(a: u16, b: u16) -> Result<i16, WrappingNumberError> {
    const MAX: i32 = i16::MAX as i32;
    const MIN: i32 = i16::MIN as i32;
    const ADJUST: i32 = (u16::MAX as i32) + 1;

    let a_i32 = i32::from(a);
    let b_i32 = i32::from(b);

    let mut result = b_i32 - a_i32;
    if (MIN..=MAX).contains(&result) {
        Ok(result as i16)
    } else if b_i32 > a_i32 {
        result = b_i32 - (a_i32 + ADJUST);
        if (MIN..=MAX).contains(&result) {
            Ok(result as i16)
        } else {
            Err(WrappingNumberError::IntegerOverflow { a, b })
        }
    } else {
        result = (b_i32 + ADJUST) - a_i32;
        if (MIN..=MAX).contains(&result) {
            Ok(result as i16)
        } else {
            Err(WrappingNumberError::IntegerOverflow { a, b })
        }
    }
}

/// Retrieves the wrapping difference between 2 u16 values.
///
/// # Panics
///
/// Panics if an impossible integer overflow occurs (this should never happen
/// with valid u16 inputs).
pub fn wrapping_diff(a: u16, b: u16) -> i16 {
    try_wrapping_diff(a, b).expect("integer overflow in wrapping_diff - this should not happen")
}

/// Converts a wrapped value received off the wire into the absolute sequence
/// closest to `reference`, for counters that wrap modulo `span` (a power of
/// two). The result is the unique sequence congruent to `value` within half
/// of `span` on either side of the reference.
pub fn make_relative(value: u16, reference: u16, span: u16) -> u16 {
    debug_assert!(span.is_power_of_two(), "sequence span must be a power of two");
    let mask = span - 1;
    let half = span / 2;

    // Offset so the representable window is centered on the reference
    reference
        .wrapping_add(half)
        .wrapping_sub(reference.wrapping_add(half).wrapping_sub(value) & mask)
}



#[cfg(test)]
mod make_relative_tests {
    use super::make_relative;
    use crate::constants::MAX_CHSEQUENCE;

    #[test]
    fn next_in_sequence() {
        // reference 5, received (5 + 1) % span
        assert_eq!(make_relative(6, 5, MAX_CHSEQUENCE), 6);
    }

    #[test]
    fn wraps_past_span() {
        // reliable counter has wrapped the 10-bit span but not u16
        let reference: u16 = MAX_CHSEQUENCE - 1; // 1023
        let received_wrapped: u16 = 2; // absolute 1026 % 1024
        assert_eq!(
            make_relative(received_wrapped, reference, MAX_CHSEQUENCE),
            MAX_CHSEQUENCE + 2
        );
    }

    #[test]
    fn slightly_behind_reference() {
        assert_eq!(make_relative(98, 100, MAX_CHSEQUENCE), 98);
    }
}
