//! Island admission predicates.
//!
//! Each filter answers whether a single island passes one criterion.
//! Combining them per user happens in the finder.

use crate::island::Island;

pub fn min_price(island: &Island, floor: i64) -> bool {
    island.turnip_price >= floor
}

pub fn max_price(island: &Island, ceiling: i64) -> bool {
    island.turnip_price <= ceiling
}

pub fn exclude_prices(island: &Island, excluded: &[i64]) -> bool {
    !excluded.contains(&island.turnip_price)
}

/// Islands with an unknown queue (-1) always pass a non-negative cap.
pub fn max_queue_size(island: &Island, cap: i64) -> bool {
    island.in_queue <= cap
}
