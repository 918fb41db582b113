use serde::Deserialize;

/// Page of rows ordered by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ListParams {
    pub limit: i64,
    pub offset: i64,
}

impl ListParams {
    pub fn new(limit: i64, offset: i64) -> Self {
        Self { limit, offset }
    }

    /// Slice bounds for in-process stores. Negative values clamp to zero.
    pub fn bounds(&self) -> (usize, usize) {
        (self.offset.max(0) as usize, self.limit.max(0) as usize)
    }
}

impl Default for ListParams {
    fn default() -> Self {
        Self { limit: 10, offset: 0 }
    }
}
