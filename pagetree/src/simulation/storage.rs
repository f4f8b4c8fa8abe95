//! Simulated in-memory page store for deterministic testing.
//!
//! This module provides an in-memory implementation of the `PageStore` trait
//! with support for fault injection at various levels:
//! - Page-level read/write errors
//! - Byte-level corruption (bit flips)
//! - Partial writes
//! - Sync failures

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::storage::{HEADER_PAGE, PAGE_SIZE, Page, PageId, PageStore, StorageError};

/// Configuration for fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of a read error (0.0 - 1.0).
    pub read_error_rate: f64,
    /// Probability of a write or allocation error (0.0 - 1.0).
    pub write_error_rate: f64,
    /// Probability of a sync error (0.0 - 1.0).
    pub sync_error_rate: f64,
    /// Probability of page corruption on read (0.0 - 1.0).
    pub corruption_rate: f64,
    /// Probability of partial write (0.0 - 1.0).
    pub partial_write_rate: f64,
}

impl FaultConfig {
    /// Create a fault config with no faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Create a fault config that only fails reads and writes.
    ///
    /// Stored bytes are never damaged, so every successful read returns
    /// exactly what was written.
    #[must_use]
    pub const fn io_errors(rate: f64) -> Self {
        Self {
            read_error_rate: rate,
            write_error_rate: rate,
            sync_error_rate: rate,
            corruption_rate: 0.0,
            partial_write_rate: 0.0,
        }
    }

    /// Create a fault config with high fault rates (for extreme testing).
    #[must_use]
    pub const fn high_faults() -> Self {
        Self {
            read_error_rate: 0.05,
            write_error_rate: 0.05,
            sync_error_rate: 0.05,
            corruption_rate: 0.05,
            partial_write_rate: 0.05,
        }
    }
}

/// Statistics about simulated page store operations.
#[derive(Debug, Default, Clone)]
pub struct SimulatedStorageStats {
    /// Number of page reads.
    pub reads: u64,
    /// Number of in-place page writes.
    pub writes: u64,
    /// Number of page allocations.
    pub allocations: u64,
    /// Number of header writes.
    pub header_writes: u64,
    /// Number of syncs.
    pub syncs: u64,
    /// Number of injected read errors.
    pub injected_read_errors: u64,
    /// Number of injected write and allocation errors.
    pub injected_write_errors: u64,
    /// Number of injected sync errors.
    pub injected_sync_errors: u64,
    /// Number of corrupted pages returned.
    pub corrupted_reads: u64,
    /// Number of partial writes.
    pub partial_writes: u64,
}

/// In-memory page store for deterministic testing.
///
/// Pages live in a map keyed by page number. The same seed always produces
/// the same sequence of faults.
pub struct SimulatedPageStore {
    pages: HashMap<PageId, Page>,
    total_pages: u64,
    fault_config: FaultConfig,
    rng: StdRng,
    stats: SimulatedStorageStats,
}

impl SimulatedPageStore {
    /// Create a new fault-free simulated store with the given seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, FaultConfig::default())
    }

    /// Create a new simulated store with custom fault configuration.
    #[must_use]
    pub fn with_config(seed: u64, fault_config: FaultConfig) -> Self {
        Self {
            pages: HashMap::new(),
            total_pages: 0,
            fault_config,
            rng: StdRng::seed_from_u64(seed),
            stats: SimulatedStorageStats::default(),
        }
    }

    /// Get the current statistics.
    #[must_use]
    pub const fn stats(&self) -> &SimulatedStorageStats {
        &self.stats
    }

    /// Reset statistics.
    pub fn reset_stats(&mut self) {
        self.stats = SimulatedStorageStats::default();
    }

    /// Update the fault configuration.
    pub fn set_fault_config(&mut self, config: FaultConfig) {
        self.fault_config = config;
    }

    /// Check if a fault should be injected based on the given rate.
    fn should_inject_fault(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        self.rng.random::<f64>() < rate
    }

    /// Corrupt a page by flipping random bits.
    fn corrupt_page(&mut self, page: &mut Page) {
        let num_flips = self.rng.random_range(1..=8);
        for _ in 0..num_flips {
            let byte_offset = self.rng.random_range(0..PAGE_SIZE);
            let bit = self.rng.random_range(0..8u8);
            page.as_bytes_mut()[byte_offset] ^= 1 << bit;
        }
    }

    /// Simulate a torn write by zeroing the tail of the page.
    fn make_partial_write(&mut self, page: &mut Page) {
        let cutoff = self.rng.random_range(0..PAGE_SIZE);
        for byte in page.as_bytes_mut().iter_mut().skip(cutoff) {
            *byte = 0;
        }
    }

    fn check_bounds(&self, page_id: PageId) -> Result<(), StorageError> {
        if page_id >= self.total_pages {
            return Err(StorageError::PageOutOfBounds {
                page_id,
                total_pages: self.total_pages,
            });
        }
        Ok(())
    }

    fn store_page(&mut self, page_id: PageId, page: &Page) -> Result<(), StorageError> {
        if self.should_inject_fault(self.fault_config.write_error_rate) {
            self.stats.injected_write_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated write error".to_string(),
            ));
        }

        let mut page_to_write = page.clone();
        if self.should_inject_fault(self.fault_config.partial_write_rate) {
            self.stats.partial_writes += 1;
            self.make_partial_write(&mut page_to_write);
        }

        self.pages.insert(page_id, page_to_write);
        Ok(())
    }
}

impl PageStore for SimulatedPageStore {
    fn read(&mut self, page_id: PageId) -> Result<Page, StorageError> {
        self.stats.reads += 1;
        self.check_bounds(page_id)?;

        if self.should_inject_fault(self.fault_config.read_error_rate) {
            self.stats.injected_read_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated read error".to_string(),
            ));
        }

        let mut page = self.pages.get(&page_id).cloned().unwrap_or_default();

        if self.should_inject_fault(self.fault_config.corruption_rate) {
            self.stats.corrupted_reads += 1;
            self.corrupt_page(&mut page);
        }

        Ok(page)
    }

    fn allocate(&mut self, page: &Page) -> Result<PageId, StorageError> {
        self.stats.allocations += 1;
        let page_id = self.total_pages;
        self.store_page(page_id, page)?;
        self.total_pages += 1;
        Ok(page_id)
    }

    fn write(&mut self, page_id: PageId, page: &Page) -> Result<(), StorageError> {
        self.stats.writes += 1;
        self.check_bounds(page_id)?;
        self.store_page(page_id, page)
    }

    fn write_header(&mut self, page: &Page) -> Result<(), StorageError> {
        self.stats.header_writes += 1;
        self.store_page(HEADER_PAGE, page)?;
        self.total_pages = self.total_pages.max(1);
        Ok(())
    }

    fn total_pages(&self) -> u64 {
        self.total_pages
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        self.stats.syncs += 1;

        if self.should_inject_fault(self.fault_config.sync_error_rate) {
            self.stats.injected_sync_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated sync error".to_string(),
            ));
        }

        // Writes are already "durable" in memory.
        Ok(())
    }
}
