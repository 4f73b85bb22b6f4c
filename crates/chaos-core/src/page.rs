use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Limit/offset window for list queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Page {
    /// Normalize raw client values. A missing, non-positive or over-max
    /// limit falls back to the default; a negative offset becomes zero.
    pub fn new(limit: Option<i64>, offset: Option<i64>) -> Self {
        let limit = match limit {
            Some(l) if l > 0 && l <= i64::from(MAX_PAGE_LIMIT) => l as u32,
            _ => DEFAULT_PAGE_LIMIT,
        };
        let offset = offset.filter(|o| *o > 0).map_or(0, |o| o.min(i64::from(u32::MAX)) as u32);
        Self { limit, offset }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}
