//! Configuration for layerstore containers
//!
//! Capacity presets plus validation. A shadow copy inherits the
//! configuration of the container it was copied from.

use crate::error::{StoreError, StoreResult};

/// Largest capacity any preset or custom config may reserve up front.
pub const MAX_CAPACITY: usize = 1 << 24;

/// Container configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Capacity reserved for local storage (Map entries, Table rows)
    pub initial_capacity: usize,
    /// Capacity reserved for every new second-level Table row
    pub row_capacity: usize,
}

impl Config {
    /// General purpose: room for a few hundred local writes before rehashing
    pub fn standard() -> Self {
        Self {
            initial_capacity: 256,
            row_capacity: 16,
        }
    }

    /// Compact: allocate lazily. Suits deep chains of short-lived overlays
    /// that usually see only a handful of writes each.
    pub fn compact() -> Self {
        Self {
            initial_capacity: 0,
            row_capacity: 0,
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_capacity > MAX_CAPACITY {
            return Err(format!("initial_capacity must be <= {}", MAX_CAPACITY));
        }
        if self.row_capacity > MAX_CAPACITY {
            return Err(format!("row_capacity must be <= {}", MAX_CAPACITY));
        }
        Ok(())
    }

    /// Validate, converting a rejection into a StoreError.
    pub(crate) fn checked(self) -> StoreResult<Self> {
        self.validate()
            .map_err(|reason| StoreError::InvalidConfig { reason })?;
        Ok(self)
    }
}

impl Default for Config {
    fn default() -> Self { Self::standard() }
}
