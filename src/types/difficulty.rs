//! Difficulty type backed by the target it corresponds to.

use std::fmt;

use bitcoin::pow::{CompactTarget, Target};

/// Minimum difficulty ever delivered to a miner. Some proxies misbehave
/// when handed smaller values.
pub const MIN_DIFFICULTY: f64 = 0.001;

/// Mining difficulty.
///
/// Internally stores the corresponding target value. Difficulty and
/// target have an inverse relationship:
/// ```text
/// target = MAX_TARGET / difficulty
/// difficulty = MAX_TARGET / target
/// ```
///
/// Used for:
/// - Stratum protocol (`mining.set_difficulty` carries a JSON number)
/// - Logging and display (human-readable values)
#[derive(Debug, Clone, Copy)]
pub struct Difficulty(Target);

impl Difficulty {
    /// Difficulty of a compact-encoded target, as found in a block
    /// header's nBits field.
    pub fn from_bits(bits: CompactTarget) -> Self {
        Self(Target::from_compact(bits))
    }

    /// Create difficulty from a target (lossless).
    pub fn from_target(target: Target) -> Self {
        Self(target)
    }

    /// Get difficulty as f64 (lossy for very large values).
    ///
    /// Uses rust-bitcoin's `difficulty_float()` for the conversion.
    pub fn as_f64(self) -> f64 {
        self.0.difficulty_float()
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.as_f64();

        // Sub-1.0 difficulties print with adaptive precision
        if value < 1.0 {
            let s = format!("{:.6}", value);
            let trimmed = s.trim_end_matches('0').trim_end_matches('.');
            return write!(f, "{}", trimmed);
        }

        // Format with SI suffixes (K, M, G, T, P)
        let (scaled, suffix) = if value >= 1e15 {
            (value / 1e15, "P")
        } else if value >= 1e12 {
            (value / 1e12, "T")
        } else if value >= 1e9 {
            (value / 1e9, "G")
        } else if value >= 1e6 {
            (value / 1e6, "M")
        } else if value >= 1e3 {
            (value / 1e3, "K")
        } else {
            (value, "")
        };

        if scaled >= 100.0 || scaled.fract() == 0.0 {
            write!(f, "{:.0}{}", scaled, suffix)
        } else if scaled >= 10.0 {
            write!(f, "{:.1}{}", scaled, suffix)
        } else {
            write!(f, "{:.2}{}", scaled, suffix)
        }
    }
}

/// Clamp a work-unit difficulty for delivery to a miner.
///
/// A positive per-session minimum replaces the computed value outright;
/// the result is never below [`MIN_DIFFICULTY`].
pub fn clamp_difficulty(mindiff: f64, diff: f64) -> f64 {
    let diff = if mindiff > 0.0 { mindiff } else { diff };
    diff.max(MIN_DIFFICULTY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn difficulty_one_is_max_target() {
        let diff = Difficulty::from_bits(CompactTarget::from_consensus(0x1d00ffff));
        assert!((diff.as_f64() - 1.0).abs() < 0.001);
    }

    #[test]
    fn regtest_bits_are_far_below_one() {
        let diff = Difficulty::from_bits(CompactTarget::from_consensus(0x207fffff));
        assert!(diff.as_f64() < 1.0);
    }

    #[test]
    fn display_si_suffixes() {
        let diff = Difficulty::from_target(Target::MAX);
        assert_eq!(diff.to_string(), "1");

        // 0x1b0404cb is a classic example header target, difficulty ~16307
        let diff = Difficulty::from_bits(CompactTarget::from_consensus(0x1b0404cb));
        assert_eq!(diff.to_string(), "16.3K");
    }

    #[test]
    fn clamp_floors_at_minimum() {
        assert_eq!(clamp_difficulty(0.0, 0.0000001), MIN_DIFFICULTY);
        assert_eq!(clamp_difficulty(0.0, 5.0), 5.0);
    }

    #[test]
    fn clamp_mindiff_overrides() {
        // A positive session minimum replaces the computed value exactly.
        assert_eq!(clamp_difficulty(8.0, 1000.0), 8.0);
        assert_eq!(clamp_difficulty(8.0, 0.5), 8.0);
        // ... but is itself floored.
        assert_eq!(clamp_difficulty(0.0001, 1000.0), MIN_DIFFICULTY);
    }
}
