//! Space preflight: refuse to start an export that cannot fit on the target volume.
//!
//! required = estimated × (1 + margin) + headroom, compared against free bytes.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ExportError, ExportResult};

/// Margin and headroom applied on top of the estimated export size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpacePolicy {
    /// Safety margin as a percentage of the estimate. Default: 10
    pub margin_pct: u32,
    /// Fixed headroom in bytes. Default: 256 MiB
    pub headroom_bytes: u64,
}

impl Default for SpacePolicy {
    fn default() -> Self {
        Self {
            margin_pct: 10,
            headroom_bytes: 256 * 1024 * 1024,
        }
    }
}

impl SpacePolicy {
    /// Bytes that must be free for an export of `estimated` bytes.
    pub fn required_bytes(&self, estimated: u64) -> u64 {
        let margin = (estimated as u128 * self.margin_pct as u128) / 100;
        let total = estimated as u128 + margin + self.headroom_bytes as u128;
        total.min(u64::MAX as u128) as u64
    }

    /// Fails with `InsufficientSpace` when `available` cannot hold the export.
    pub fn check(&self, estimated: u64, available: u64) -> ExportResult<u64> {
        let required = self.required_bytes(estimated);
        debug!(estimated, required, available, "space preflight");
        if required > available {
            return Err(ExportError::InsufficientSpace {
                required,
                available,
            });
        }
        Ok(required)
    }
}

/// Formats a byte count for humans (binary units).
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_required_bytes_formula() {
        let policy = SpacePolicy {
            margin_pct: 10,
            headroom_bytes: 256 * MIB,
        };
        assert_eq!(policy.required_bytes(1000 * MIB), 1100 * MIB + 256 * MIB);
        assert_eq!(policy.required_bytes(0), 256 * MIB);
    }

    #[test]
    fn test_ten_gib_does_not_fit_in_two_gib() {
        let policy = SpacePolicy::default();
        let err = policy.check(10 * GIB, 2 * GIB).unwrap_err();
        match err {
            ExportError::InsufficientSpace {
                required,
                available,
            } => {
                assert_eq!(available, 2 * GIB);
                assert_eq!(required, 11 * GIB + 256 * MIB);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_fits_exactly() {
        let policy = SpacePolicy {
            margin_pct: 0,
            headroom_bytes: 0,
        };
        assert_eq!(policy.check(500, 500).unwrap(), 500);
        assert!(policy.check(501, 500).is_err());
    }

    #[test]
    fn test_required_bytes_saturates() {
        let policy = SpacePolicy::default();
        assert_eq!(policy.required_bytes(u64::MAX), u64::MAX);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(256 * MIB), "256.00 MB");
        assert_eq!(format_bytes(2 * GIB), "2.00 GB");
        assert_eq!(format_bytes(3 * 1024 * GIB), "3.00 TB");
    }
}
