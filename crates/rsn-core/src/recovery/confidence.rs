/// Confidence scoring from the structural integrity of a metadata record
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::BlockRange;

/// What a parser could verify about one record
#[derive(Debug, Clone, PartialEq)]
pub struct RecordIntegrity {
    /// Record magic / signature and minimum size checks passed
    pub signature_valid: bool,
    /// A real name was decoded (not a placeholder)
    pub name_decoded: bool,
    /// File type could be classified from metadata
    pub type_known: bool,
    /// 0.0-1.0, see [`size_consistency`]
    pub size_consistency: f32,
    pub timestamps_plausible: bool,
    /// Extents are in bounds and do not overlap
    pub extents_valid: bool,
    /// `None` when the format carries no checksum or it was not checked
    pub checksum_verified: Option<bool>,
}

impl RecordIntegrity {
    /// A record whose signature matched and nothing else could be verified
    pub fn signature_only() -> Self {
        Self {
            signature_valid: true,
            name_decoded: false,
            type_known: false,
            size_consistency: 0.0,
            timestamps_plausible: false,
            extents_valid: false,
            checksum_verified: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfidenceTier {
    Low,
    Medium,
    High,
}

impl ConfidenceTier {
    pub const HIGH_THRESHOLD: f32 = 0.8;
    pub const LOW_THRESHOLD: f32 = 0.3;

    pub fn from_score(score: f32) -> Self {
        if score >= Self::HIGH_THRESHOLD {
            ConfidenceTier::High
        } else if score > Self::LOW_THRESHOLD {
            ConfidenceTier::Medium
        } else {
            ConfidenceTier::Low
        }
    }
}

impl std::fmt::Display for ConfidenceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfidenceTier::Low => write!(f, "Low"),
            ConfidenceTier::Medium => write!(f, "Medium"),
            ConfidenceTier::High => write!(f, "High"),
        }
    }
}

#[derive(Debug)]
struct ConfidenceFactor {
    #[allow(dead_code)]
    name: &'static str,
    score: f32,
    weight: f32,
}

fn flag(value: bool) -> f32 {
    if value {
        1.0
    } else {
        0.0
    }
}

/// Weighted average of the integrity factors, clamped to 0.0-1.0
pub fn calculate_confidence_score(integrity: &RecordIntegrity) -> f32 {
    let mut factors = vec![
        ConfidenceFactor {
            name: "signature",
            score: flag(integrity.signature_valid),
            weight: 0.25,
        },
        ConfidenceFactor {
            name: "name",
            score: flag(integrity.name_decoded),
            weight: 0.15,
        },
        ConfidenceFactor {
            name: "file_type",
            score: flag(integrity.type_known),
            weight: 0.10,
        },
        ConfidenceFactor {
            name: "size_consistency",
            score: integrity.size_consistency.clamp(0.0, 1.0),
            weight: 0.15,
        },
        ConfidenceFactor {
            name: "timestamps",
            score: flag(integrity.timestamps_plausible),
            weight: 0.15,
        },
        ConfidenceFactor {
            name: "extents",
            score: flag(integrity.extents_valid),
            weight: 0.20,
        },
    ];

    if let Some(verified) = integrity.checksum_verified {
        factors.push(ConfidenceFactor {
            name: "checksum",
            score: flag(verified),
            weight: 0.10,
        });
    }

    let total_weighted_score: f32 = factors.iter().map(|f| f.score * f.weight).sum();
    let total_weight: f32 = factors.iter().map(|f| f.weight).sum();

    let confidence = if total_weight > 0.0 {
        total_weighted_score / total_weight
    } else {
        0.0
    };

    confidence.clamp(0.0, 1.0)
}

/// Compare the recorded size with the bytes its extents cover.
///
/// Allocation is rounded up to whole blocks, so slack smaller than one block
/// counts as a perfect match. `inline` is for data stored inside the record.
pub fn size_consistency(declared_size: u64, extents: &[BlockRange], inline: bool) -> f32 {
    if inline {
        return 1.0;
    }

    let allocated: u64 = extents.iter().map(BlockRange::byte_len).sum();
    let unit = extents.iter().map(|r| r.block_size as u64).max().unwrap_or(0);

    if declared_size == 0 && allocated == 0 {
        return 1.0;
    }

    if declared_size == 0 || allocated == 0 {
        return 0.2;
    }

    if declared_size <= allocated {
        if allocated - declared_size < unit.max(1) {
            1.0
        } else {
            declared_size as f32 / allocated as f32
        }
    } else {
        allocated as f32 / declared_size as f32
    }
}

/// Every present timestamp lies between 1980 and one day after the scan,
/// and at least one is present
pub fn timestamps_plausible(times: &[Option<DateTime<Utc>>], scan_time: DateTime<Utc>) -> bool {
    let Some(floor) = Utc.with_ymd_and_hms(1980, 1, 1, 0, 0, 0).single() else {
        return false;
    };
    let ceiling = scan_time + Duration::days(1);

    let present: Vec<&DateTime<Utc>> = times.iter().flatten().collect();
    !present.is_empty() && present.iter().all(|t| **t >= floor && **t <= ceiling)
}

/// Extents end inside the device and do not overlap each other
pub fn extents_valid(extents: &[BlockRange], device_size: u64) -> bool {
    let in_bounds = extents.iter().all(|r| {
        r.block_count > 0
            && r
                .byte_offset()
                .checked_add(r.byte_len())
                .is_some_and(|end| end <= device_size)
    });
    in_bounds && !check_extent_overlaps(extents)
}

fn check_extent_overlaps(blocks: &[BlockRange]) -> bool {
    let mut sorted: Vec<(u64, u64)> = blocks
        .iter()
        .map(|r| (r.byte_offset(), r.byte_offset().saturating_add(r.byte_len())))
        .collect();
    sorted.sort_unstable();
    sorted.windows(2).any(|pair| pair[1].0 < pair[0].1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> RecordIntegrity {
        RecordIntegrity {
            signature_valid: true,
            name_decoded: true,
            type_known: true,
            size_consistency: 1.0,
            timestamps_plausible: true,
            extents_valid: true,
            checksum_verified: None,
        }
    }

    #[test]
    fn test_complete_record_is_high() {
        let score = calculate_confidence_score(&complete());
        assert!(score >= 0.8);
        assert_eq!(ConfidenceTier::from_score(score), ConfidenceTier::High);
    }

    #[test]
    fn test_signature_only_is_low() {
        let score = calculate_confidence_score(&RecordIntegrity::signature_only());
        assert!(score <= 0.3);
        assert_eq!(ConfidenceTier::from_score(score), ConfidenceTier::Low);
    }

    #[test]
    fn test_partial_record_is_medium() {
        let integrity = RecordIntegrity {
            name_decoded: false,
            timestamps_plausible: false,
            extents_valid: false,
            ..complete()
        };
        let score = calculate_confidence_score(&integrity);
        assert_eq!(ConfidenceTier::from_score(score), ConfidenceTier::Medium);
    }

    #[test]
    fn test_failed_checksum_lowers_score() {
        let verified = calculate_confidence_score(&RecordIntegrity {
            checksum_verified: Some(true),
            ..complete()
        });
        let failed = calculate_confidence_score(&RecordIntegrity {
            checksum_verified: Some(false),
            ..complete()
        });
        assert!(failed < verified);
        assert!((0.0..=1.0).contains(&failed));
    }

    #[test]
    fn test_size_consistency() {
        let one_block = [BlockRange::new(100, 1, 4096)];
        assert_eq!(size_consistency(10, &one_block, false), 1.0);
        assert_eq!(size_consistency(4096, &one_block, false), 1.0);
        assert_eq!(size_consistency(8192, &one_block, false), 0.5);
        assert_eq!(size_consistency(0, &[], false), 1.0);
        assert_eq!(size_consistency(100, &[], false), 0.2);
        assert_eq!(size_consistency(100, &[], true), 1.0);
    }

    #[test]
    fn test_timestamps_plausible() {
        let now = Utc::now();
        let old = Utc.with_ymd_and_hms(1970, 1, 2, 0, 0, 0).single();
        assert!(timestamps_plausible(&[Some(now), None], now));
        assert!(!timestamps_plausible(&[None, None], now));
        assert!(!timestamps_plausible(&[Some(now), old], now));
        assert!(!timestamps_plausible(&[Some(now + Duration::days(30))], now));
    }

    #[test]
    fn test_extents_valid() {
        let a = BlockRange::new(0, 2, 512);
        let b = BlockRange::new(2, 2, 512);
        let overlapping = BlockRange::new(1, 2, 512);
        assert!(extents_valid(&[a, b], 2048));
        assert!(!extents_valid(&[a, b], 2047));
        assert!(!extents_valid(&[a, overlapping], 4096));
        assert!(!extents_valid(&[BlockRange::new(0, 0, 512)], 4096));
        assert!(extents_valid(&[], 0));
    }
}
