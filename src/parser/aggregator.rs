//! Text-protocol row handling for cross-shard merging
//!
//! - Splitting row payloads into cells and re-encoding them
//! - Folding aggregate columns (COUNT, SUM, MAX, MIN) across shards
//! - Ordering rows by projected columns

use bytes::{Bytes, BytesMut};
use std::cmp::Ordering;

use super::analyzer::{AggregateInfo, AggregateType, OrderKey};
use crate::protocol::packet::{put_lenenc_str, read_lenenc_int};

/// One cell of a text row; `None` is SQL NULL
pub type Cell = Option<Bytes>;

/// Numeric view of a cell
#[derive(Debug, Clone, Copy, PartialEq)]
enum Number {
    Integer(i64),
    Float(f64),
}

impl Number {
    fn parse(data: &[u8]) -> Option<Self> {
        let s = std::str::from_utf8(data).ok()?;
        if let Ok(i) = s.parse::<i64>() {
            return Some(Number::Integer(i));
        }
        s.parse::<f64>().ok().map(Number::Float)
    }

    fn as_f64(self) -> f64 {
        match self {
            Number::Integer(i) => i as f64,
            Number::Float(f) => f,
        }
    }

    fn add(self, other: Number) -> Number {
        match (self, other) {
            (Number::Integer(a), Number::Integer(b)) => match a.checked_add(b) {
                Some(sum) => Number::Integer(sum),
                None => Number::Float(a as f64 + b as f64),
            },
            (a, b) => Number::Float(a.as_f64() + b.as_f64()),
        }
    }

    fn encode(self) -> Bytes {
        match self {
            Number::Integer(i) => Bytes::from(i.to_string()),
            Number::Float(f) => {
                let s = format!("{:.6}", f);
                let s = s.trim_end_matches('0').trim_end_matches('.');
                Bytes::from(s.to_string())
            }
        }
    }
}

/// Split a text-protocol row payload into `column_count` cells
pub fn parse_text_row(data: &[u8], column_count: usize) -> Option<Vec<Cell>> {
    let mut cells = Vec::with_capacity(column_count);
    let mut offset = 0;

    for _ in 0..column_count {
        match data.get(offset)? {
            0xFB => {
                cells.push(None);
                offset += 1;
            }
            _ => {
                let (len, used) = read_lenenc_int(&data[offset..])?;
                offset += used;
                let end = offset.checked_add(len as usize)?;
                cells.push(Some(Bytes::copy_from_slice(data.get(offset..end)?)));
                offset = end;
            }
        }
    }

    (offset == data.len()).then_some(cells)
}

/// Encode cells as a text-protocol row payload
pub fn encode_text_row(cells: &[Cell]) -> Bytes {
    let mut payload = BytesMut::new();
    for cell in cells {
        match cell {
            None => payload.extend_from_slice(&[0xFB]),
            Some(value) => put_lenenc_str(&mut payload, value),
        }
    }
    payload.freeze()
}

/// Accumulates one aggregate column across shard rows
#[derive(Debug, Clone)]
pub struct AggregateFolder {
    info: AggregateInfo,
    value: Option<Number>,
    /// Raw value kept for MIN/MAX over non-numeric cells
    raw: Option<Bytes>,
}

impl AggregateFolder {
    pub fn new(info: AggregateInfo) -> Self {
        Self {
            info,
            value: None,
            raw: None,
        }
    }

    pub fn position(&self) -> usize {
        self.info.position
    }

    /// AVG and DISTINCT aggregates cannot be recombined from per-shard results
    pub fn is_mergeable(info: &AggregateInfo) -> bool {
        info.func_type != AggregateType::Avg && !info.is_distinct
    }

    pub fn fold(&mut self, cell: &Cell) {
        let Some(data) = cell else {
            return;
        };
        let number = Number::parse(data);

        match self.info.func_type {
            AggregateType::Count | AggregateType::Sum => {
                if let Some(n) = number {
                    self.value = Some(match self.value {
                        Some(current) => current.add(n),
                        None => n,
                    });
                }
            }
            AggregateType::Max | AggregateType::Min => {
                let wanted = if self.info.func_type == AggregateType::Max {
                    Ordering::Greater
                } else {
                    Ordering::Less
                };
                let replace = match &self.raw {
                    None => true,
                    Some(current) => compare_values(data, current) == wanted,
                };
                if replace {
                    self.raw = Some(data.clone());
                }
            }
            AggregateType::Avg => {}
        }
    }

    pub fn finish(&self) -> Cell {
        match self.info.func_type {
            AggregateType::Count => Some(self.value.unwrap_or(Number::Integer(0)).encode()),
            AggregateType::Sum => self.value.map(Number::encode),
            AggregateType::Max | AggregateType::Min => self.raw.clone(),
            AggregateType::Avg => None,
        }
    }
}

/// Compare two non-NULL cell values, numerically when both are numbers
pub fn compare_values(a: &[u8], b: &[u8]) -> Ordering {
    match (Number::parse(a), Number::parse(b)) {
        (Some(x), Some(y)) => x.as_f64().partial_cmp(&y.as_f64()).unwrap_or(Ordering::Equal),
        _ => a.cmp(b),
    }
}

/// Row ordering for ORDER BY keys; NULL sorts first as in MySQL
pub fn compare_rows(a: &[Cell], b: &[Cell], keys: &[OrderKey]) -> Ordering {
    for key in keys {
        let ord = match (a.get(key.position), b.get(key.position)) {
            (Some(Some(x)), Some(Some(y))) => compare_values(x, y),
            (Some(None), Some(Some(_))) => Ordering::Less,
            (Some(Some(_)), Some(None)) => Ordering::Greater,
            _ => Ordering::Equal,
        };
        let ord = if key.descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(func_type: AggregateType) -> AggregateInfo {
        AggregateInfo {
            func_type,
            position: 0,
            expr_str: String::new(),
            is_distinct: false,
        }
    }

    fn cell(s: &str) -> Cell {
        Some(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[test]
    fn test_row_round_trip_with_null() {
        let cells = vec![cell("10"), None, cell("abc")];
        let payload = encode_text_row(&cells);
        assert_eq!(parse_text_row(&payload, 3), Some(cells));
        // trailing garbage or short rows are rejected
        assert_eq!(parse_text_row(&payload, 2), None);
        assert_eq!(parse_text_row(&payload, 4), None);
    }

    #[test]
    fn test_count_and_sum() {
        let mut count = AggregateFolder::new(info(AggregateType::Count));
        for v in ["10", "20", "30"] {
            count.fold(&cell(v));
        }
        assert_eq!(count.finish(), cell("60"));

        let mut sum = AggregateFolder::new(info(AggregateType::Sum));
        sum.fold(&cell("100.5"));
        sum.fold(&None);
        sum.fold(&cell("200"));
        assert_eq!(sum.finish(), cell("300.5"));

        let empty = AggregateFolder::new(info(AggregateType::Sum));
        assert_eq!(empty.finish(), None);
    }

    #[test]
    fn test_max_min() {
        let mut max = AggregateFolder::new(info(AggregateType::Max));
        let mut min = AggregateFolder::new(info(AggregateType::Min));
        for v in ["100", "9", "200"] {
            max.fold(&cell(v));
            min.fold(&cell(v));
        }
        assert_eq!(max.finish(), cell("200"));
        assert_eq!(min.finish(), cell("9"));
    }

    #[test]
    fn test_avg_not_mergeable() {
        assert!(!AggregateFolder::is_mergeable(&info(AggregateType::Avg)));
        assert!(AggregateFolder::is_mergeable(&info(AggregateType::Count)));
    }

    #[test]
    fn test_compare_rows() {
        let keys = [OrderKey {
            position: 0,
            descending: true,
        }];
        let a = vec![cell("2")];
        let b = vec![cell("10")];
        assert_eq!(compare_rows(&a, &b, &keys), Ordering::Greater);
        assert_eq!(compare_rows(&[None], &b, &keys), Ordering::Greater);
    }
}
