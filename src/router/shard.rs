use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Shard key value - integer or string literal
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ShardValue {
    Integer(i64),
    String(String),
}

impl ShardValue {
    pub fn hash_code(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ShardValue::Integer(v) => Some(*v),
            ShardValue::String(s) => s.parse().ok(),
        }
    }
}

impl From<i64> for ShardValue {
    fn from(v: i64) -> Self {
        ShardValue::Integer(v)
    }
}

impl From<&str> for ShardValue {
    fn from(v: &str) -> Self {
        ShardValue::String(v.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardAlgorithm {
    /// Integers: value mod shard_count; strings fall back to the hash
    Mod,
    /// hash(value) mod shard_count
    Hash,
    /// Integer ranges split by sorted boundaries
    Range,
}

impl ShardAlgorithm {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "mod" | "modulo" => Some(Self::Mod),
            "hash" => Some(Self::Hash),
            "range" => Some(Self::Range),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShardCalculator {
    algorithm: ShardAlgorithm,
    shard_count: usize,
    /// Sorted, range algorithm only
    range_boundaries: Vec<i64>,
}

impl ShardCalculator {
    pub fn new(algorithm: ShardAlgorithm, shard_count: usize) -> Self {
        Self {
            algorithm,
            shard_count: shard_count.max(1),
            range_boundaries: vec![],
        }
    }

    /// `[100, 200]` gives shard 0 for `< 100`, 1 for `[100, 200)`, 2 for `>= 200`
    pub fn new_range(mut boundaries: Vec<i64>) -> Self {
        boundaries.sort_unstable();
        Self {
            algorithm: ShardAlgorithm::Range,
            shard_count: boundaries.len() + 1,
            range_boundaries: boundaries,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    pub fn calculate(&self, value: &ShardValue) -> usize {
        match (self.algorithm, value) {
            (ShardAlgorithm::Mod, ShardValue::Integer(v)) => {
                v.rem_euclid(self.shard_count as i64) as usize
            }
            (ShardAlgorithm::Mod | ShardAlgorithm::Hash, _) => {
                (value.hash_code() % self.shard_count as u64) as usize
            }
            (ShardAlgorithm::Range, _) => match value.as_i64() {
                Some(v) => self.range_index(v),
                None => 0,
            },
        }
    }

    /// Deduplicated, sorted shard indices for a value list
    pub fn calculate_all(&self, values: &[ShardValue]) -> Vec<usize> {
        let mut shards: Vec<usize> = values.iter().map(|v| self.calculate(v)).collect();
        shards.sort_unstable();
        shards.dedup();
        shards
    }

    /// Shards that may hold values in `[start, end]`
    pub fn calculate_between(&self, start: i64, end: i64) -> Vec<usize> {
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        match self.algorithm {
            ShardAlgorithm::Range => (self.range_index(start)..=self.range_index(end)).collect(),
            ShardAlgorithm::Mod | ShardAlgorithm::Hash => {
                let span = end.abs_diff(start);
                if span >= self.shard_count as u64 {
                    self.all_shards()
                } else {
                    let values: Vec<ShardValue> = (start..=end).map(ShardValue::Integer).collect();
                    self.calculate_all(&values)
                }
            }
        }
    }

    pub fn all_shards(&self) -> Vec<usize> {
        (0..self.shard_count).collect()
    }

    fn range_index(&self, value: i64) -> usize {
        self.range_boundaries.partition_point(|&b| b <= value)
    }
}
