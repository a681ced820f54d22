//! Memory budget of a sync

use tracing::{debug, warn};

/// One kilobyte
pub const KILOBYTE: u64 = 1024;
/// One megabyte
pub const MEGABYTE: u64 = 1024 * KILOBYTE;
/// One gigabyte
pub const GIGABYTE: u64 = 1024 * MEGABYTE;

/// Environment variable forcing the smallest sync footprint
pub const FORCE_MINIMUM_SPEC_ENV: &str = "ASGARD_BRIDGE_SYNC_FORCE_MINIMUM_SPEC";

const MIN_SYNC_MEMORY: u64 = 800 * MEGABYTE;

/// Convert a byte count to megabytes for logging
pub fn to_mb(bytes: u64) -> f64 {
    bytes as f64 / MEGABYTE as f64
}

/// Derived sizes for the download and build stages of a sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncLimits {
    /// Upper bound of a download request at 2 GB of sync memory
    pub max_download_request_mem: u64,
    /// Lower bound of a download request
    pub min_download_request_mem: u64,
    /// Upper bound of a build chunk at 2 GB of sync memory
    pub max_message_building_mem: u64,
    /// Lower bound of a build chunk
    pub min_message_building_mem: u64,
    /// Memory the whole sync may use
    pub max_sync_memory: u64,
    /// Parallel message and attachment downloads
    pub max_parallel_downloads: usize,
    /// Expected bytes per download request
    pub download_request_mem: u64,
    /// Estimated bytes per build chunk
    pub message_build_mem: u64,
}

impl SyncLimits {
    /// Compute the limits for a requested sync memory.
    ///
    /// `total_memory` is the system memory; the sync never gets more than half
    /// of it, and never less than 800 MB.
    pub fn new(max_sync_memory: u64, total_memory: u64, force_minimum: bool) -> Self {
        let mut limits = Self {
            max_download_request_mem: 128 * MEGABYTE,
            min_download_request_mem: 40 * MEGABYTE,
            max_message_building_mem: 128 * MEGABYTE,
            min_message_building_mem: 64 * MEGABYTE,
            max_sync_memory,
            max_parallel_downloads: 32,
            download_request_mem: 0,
            message_build_mem: 0,
        };

        if force_minimum {
            warn!("Sync limits forced to minimum");
            limits.max_download_request_mem = 50 * MEGABYTE;
            limits.max_message_building_mem = 80 * MEGABYTE;
            limits.max_parallel_downloads = 2;
            limits.max_sync_memory = MIN_SYNC_MEMORY;
        }

        if limits.max_sync_memory >= total_memory / 2 {
            warn!(
                "Requested sync memory of {:.0} MB is more than half of system memory, using {:.0} MB",
                to_mb(limits.max_sync_memory),
                to_mb(total_memory / 2)
            );
            limits.max_sync_memory = total_memory / 2;
        }

        if limits.max_sync_memory < MIN_SYNC_MEMORY {
            warn!(
                "Requested sync memory of {:.0} MB is below the 800 MB minimum, using 800 MB",
                to_mb(limits.max_sync_memory)
            );
            limits.max_sync_memory = MIN_SYNC_MEMORY;
        }

        if limits.max_sync_memory < 2 * GIGABYTE {
            limits.download_request_mem = limits.min_download_request_mem;
            limits.message_build_mem = limits.min_message_building_mem;
        } else if limits.max_sync_memory == 2 * GIGABYTE {
            limits.download_request_mem = limits.max_download_request_mem;
            limits.message_build_mem = limits.max_message_building_mem;
        } else {
            // Download and build stages each use about four times their budget.
            let remaining = (limits.max_sync_memory - 2 * GIGABYTE) / 8;
            limits.download_request_mem = limits.max_download_request_mem + remaining;
            limits.message_build_mem = limits.max_message_building_mem + remaining;
        }

        debug!(
            "Sync memory: download={:.0} MB, build={:.0} MB, predicted max={:.0} MB",
            to_mb(limits.download_request_mem),
            to_mb(limits.message_build_mem),
            to_mb(limits.download_request_mem * 4 + limits.message_build_mem * 4)
        );

        limits
    }

    /// Cap parallel downloads to a configured value
    pub fn with_parallel_downloads(mut self, parallel: usize) -> Self {
        self.max_parallel_downloads = self.max_parallel_downloads.min(parallel.max(1));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOTAL: u64 = 64 * GIGABYTE;

    #[test]
    fn test_below_two_gigabytes_uses_minimums() {
        let limits = SyncLimits::new(GIGABYTE, TOTAL, false);

        assert_eq!(limits.max_sync_memory, GIGABYTE);
        assert_eq!(limits.download_request_mem, 40 * MEGABYTE);
        assert_eq!(limits.message_build_mem, 64 * MEGABYTE);
        assert_eq!(limits.max_parallel_downloads, 32);
    }

    #[test]
    fn test_two_gigabytes_uses_maximums() {
        let limits = SyncLimits::new(2 * GIGABYTE, TOTAL, false);

        assert_eq!(limits.download_request_mem, 128 * MEGABYTE);
        assert_eq!(limits.message_build_mem, 128 * MEGABYTE);
    }

    #[test]
    fn test_above_two_gigabytes_scales() {
        let limits = SyncLimits::new(10 * GIGABYTE, TOTAL, false);

        assert_eq!(limits.download_request_mem, 128 * MEGABYTE + GIGABYTE);
        assert_eq!(limits.message_build_mem, 128 * MEGABYTE + GIGABYTE);
    }

    #[test]
    fn test_clamped_to_half_of_system_memory() {
        let limits = SyncLimits::new(8 * GIGABYTE, 4 * GIGABYTE, false);

        assert_eq!(limits.max_sync_memory, 2 * GIGABYTE);
        assert_eq!(limits.download_request_mem, 128 * MEGABYTE);
    }

    #[test]
    fn test_minimum_sync_memory() {
        let limits = SyncLimits::new(100 * MEGABYTE, TOTAL, false);
        assert_eq!(limits.max_sync_memory, 800 * MEGABYTE);

        let limits = SyncLimits::new(2 * GIGABYTE, GIGABYTE, false);
        assert_eq!(limits.max_sync_memory, 800 * MEGABYTE);
    }

    #[test]
    fn test_force_minimum() {
        let limits = SyncLimits::new(16 * GIGABYTE, TOTAL, true);

        assert_eq!(limits.max_sync_memory, 800 * MEGABYTE);
        assert_eq!(limits.max_parallel_downloads, 2);
        assert_eq!(limits.download_request_mem, 40 * MEGABYTE);
        assert_eq!(limits.max_download_request_mem, 50 * MEGABYTE);
    }

    #[test]
    fn test_parallel_download_cap() {
        let limits = SyncLimits::new(GIGABYTE, TOTAL, false).with_parallel_downloads(8);
        assert_eq!(limits.max_parallel_downloads, 8);

        let limits = SyncLimits::new(GIGABYTE, TOTAL, false).with_parallel_downloads(100);
        assert_eq!(limits.max_parallel_downloads, 32);
    }
}
