//! Result abnormality classification.
//!
//! Reference ranges arrive as free-text `"low-high"` strings from the catalog.
//! Classification is best-effort: an unparsable range leaves the item
//! unclassified rather than failing the recording.

use serde::{Deserialize, Serialize};

/// Abnormality classification of a numeric result against its reference range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbnormalFlag {
    Low,
    Normal,
    High,
}

/// Parse a `"low-high"` reference range string.
///
/// Returns `None` for anything that is not two ascending numbers around a
/// single dash (missing bounds, text, inverted ranges).
pub fn parse_reference_range(range: &str) -> Option<(f64, f64)> {
    let (low, high) = range.trim().split_once('-')?;
    let low: f64 = low.trim().parse().ok()?;
    let high: f64 = high.trim().parse().ok()?;
    if low > high {
        return None;
    }
    Some((low, high))
}

/// Classify a numeric value against a reference range string.
pub fn classify(value: f64, reference_range: &str) -> Option<AbnormalFlag> {
    let (low, high) = parse_reference_range(reference_range)?;
    if value < low {
        Some(AbnormalFlag::Low)
    } else if value > high {
        Some(AbnormalFlag::High)
    } else {
        Some(AbnormalFlag::Normal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_against_range() {
        assert_eq!(classify(3.9, "4.0-11.0"), Some(AbnormalFlag::Low));
        assert_eq!(classify(4.0, "4.0-11.0"), Some(AbnormalFlag::Normal));
        assert_eq!(classify(7.2, "4.0-11.0"), Some(AbnormalFlag::Normal));
        assert_eq!(classify(11.0, "4.0-11.0"), Some(AbnormalFlag::Normal));
        assert_eq!(classify(11.1, "4.0-11.0"), Some(AbnormalFlag::High));
    }

    #[test]
    fn tolerates_whitespace_around_bounds() {
        assert_eq!(classify(5.0, " 4.0 - 11.0 "), Some(AbnormalFlag::Normal));
    }

    #[test]
    fn unparsable_ranges_leave_result_unclassified() {
        assert_eq!(classify(5.0, ""), None);
        assert_eq!(classify(5.0, "negative"), None);
        assert_eq!(classify(5.0, "4.0"), None);
        assert_eq!(classify(5.0, "low-high"), None);
        // Inverted bounds are treated as unparsable, not silently reordered.
        assert_eq!(classify(5.0, "11.0-4.0"), None);
    }

    mod proptest_tests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            /// Property: for any well-formed ascending range, classification
            /// agrees with plain comparison against the bounds.
            #[test]
            fn classification_matches_comparison(
                // Negative lows would serialize with a leading minus and split
                // on the wrong dash; clinical ranges are non-negative anyway.
                low in 0.0f64..1000.0,
                span in 0.0f64..1000.0,
                value in -2000.0f64..2000.0,
            ) {
                let high = low + span;
                let range = format!("{low}-{high}");

                let expected = if value < low {
                    AbnormalFlag::Low
                } else if value > high {
                    AbnormalFlag::High
                } else {
                    AbnormalFlag::Normal
                };
                prop_assert_eq!(classify(value, &range), Some(expected));
            }
        }
    }
}
