//! Conversions between the integer types used for window sizes, quotas and sequence number
//!  distances.

pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

impl SafeCast<u64> for u32 {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}

/// For narrowing casts where business logic ensures that the value is in the narrower type's range.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}

/// Narrowing that saturates instead of failing, for values that are only upper bounded by
///  configuration (e.g. the distance between two sequence numbers compared to a window size)
pub trait SaturatingCast<T> {
    fn saturating_cast(self) -> T;
}

impl SaturatingCast<u32> for u64 {
    fn saturating_cast(self) -> u32 {
        self.try_into().unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::small(5, 5)]
    #[case::max(u32::MAX as u64, u32::MAX)]
    #[case::beyond(u32::MAX as u64 + 1, u32::MAX)]
    #[case::huge(u64::MAX, u32::MAX)]
    fn test_saturating_cast(#[case] value: u64, #[case] expected: u32) {
        let actual: u32 = value.saturating_cast();
        assert_eq!(actual, expected);
    }
}
