use common::ErrorLocation;

use std::panic::Location;
use std::time::Duration;

use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum RateLimitError {
    /// Not enough tokens; `retry_after` is the wait until there will be.
    #[error("Rate Limited Error: category '{category}' retry after {retry_after:?} {location}")]
    Denied {
        category: String,
        retry_after: Duration,
        location: ErrorLocation,
    },

    /// The cost can never be admitted by this bucket.
    #[error("Cost Error: cost {cost} exceeds capacity {capacity} of '{category}' {location}")]
    CostExceedsCapacity {
        category: String,
        cost: f64,
        capacity: f64,
        location: ErrorLocation,
    },

    /// Costs must be positive and finite.
    #[error("Cost Error: invalid cost {cost} for '{category}' {location}")]
    InvalidCost {
        category: String,
        cost: f64,
        location: ErrorLocation,
    },
}

impl RateLimitError {
    #[track_caller]
    pub fn denied(category: impl Into<String>, retry_after: Duration) -> Self {
        RateLimitError::Denied {
            category: category.into(),
            retry_after,
            location: ErrorLocation::from(Location::caller()),
        }
    }

    #[track_caller]
    pub fn cost_exceeds_capacity(category: impl Into<String>, cost: f64, capacity: f64) -> Self {
        RateLimitError::CostExceedsCapacity {
            category: category.into(),
            cost,
            capacity,
            location: ErrorLocation::from(Location::caller()),
        }
    }

    #[track_caller]
    pub fn invalid_cost(category: impl Into<String>, cost: f64) -> Self {
        RateLimitError::InvalidCost {
            category: category.into(),
            cost,
            location: ErrorLocation::from(Location::caller()),
        }
    }

    /// Wait suggested by a denial, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateLimitError::Denied { retry_after, .. } => Some(*retry_after),
            RateLimitError::CostExceedsCapacity { .. } | RateLimitError::InvalidCost { .. } => {
                None
            }
        }
    }
}
