use serde::{Deserialize, Serialize};
use utoipa::IntoParams;
use validator::Validate;

use crate::errors::ServiceError;

pub const MAX_PER_PAGE: u64 = 100;

/// Validate request input
pub fn validate_input<T: Validate>(input: &T) -> Result<(), ServiceError> {
    input.validate().map_err(ServiceError::from)
}

/// Pagination parameters for list operations
#[derive(Debug, Deserialize, Serialize, IntoParams)]
pub struct PaginationParams {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_per_page")]
    pub per_page: u64,
}

fn default_page() -> u64 {
    1
}

fn default_per_page() -> u64 {
    20
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self {
            page: default_page(),
            per_page: default_per_page(),
        }
    }
}

impl PaginationParams {
    /// Page and page size clamped to sane bounds
    pub fn normalized(&self) -> (u64, u64) {
        (self.page.max(1), self.per_page.clamp(1, MAX_PER_PAGE))
    }
}

pub fn total_pages(total: u64, per_page: u64) -> u64 {
    if total == 0 {
        0
    } else {
        (total + per_page - 1) / per_page
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_is_clamped() {
        let params = PaginationParams {
            page: 0,
            per_page: 1000,
        };
        assert_eq!(params.normalized(), (1, MAX_PER_PAGE));
        assert_eq!(total_pages(0, 20), 0);
        assert_eq!(total_pages(41, 20), 3);
    }
}
