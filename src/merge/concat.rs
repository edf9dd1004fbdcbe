//! Default merger: concatenates shard results and applies the cross-shard
//! parts of the statement (aggregates, GROUP BY, DISTINCT, ORDER BY, LIMIT).

use std::collections::HashMap;

use bytes::Bytes;
use tracing::debug;

use super::{logical_payloads, MergeError, MergeStatus, ResultMerger};
use crate::parser::{compare_rows, encode_text_row, parse_text_row, AggregateFolder, Cell, SqlAnalysis};
use crate::protocol::packet::read_lenenc_int;
use crate::protocol::{error_codes, is_eof_packet, is_err_packet, status, EofPacket, ErrPacket, OkPacket, Packet};

/// Shape of the first response, every other one must match it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Ok,
    Rows(u64),
}

pub struct ConcatMerger {
    analysis: Option<SqlAnalysis>,
    expected: usize,
    received: usize,
    capabilities: u32,
    shape: Option<Shape>,
    /// First ERR seen; reported once every response is in
    error: Option<ErrPacket>,

    affected_rows: u64,
    last_insert_id: u64,
    warnings: u16,
    server_status: u16,

    header: Vec<Bytes>,
    rows: Vec<Bytes>,
    output: Vec<Bytes>,
    header_sent: bool,
    emitted: bool,
}

impl ConcatMerger {
    /// `analysis` describes the original statement; `None` merges by plain
    /// concatenation. `expected` is the number of responses to merge.
    pub fn new(analysis: Option<SqlAnalysis>, expected: usize, capabilities: u32) -> Self {
        Self {
            analysis,
            expected,
            received: 0,
            capabilities,
            shape: None,
            error: None,
            affected_rows: 0,
            last_insert_id: 0,
            warnings: 0,
            server_status: 0,
            header: Vec::new(),
            rows: Vec::new(),
            output: Vec::new(),
            header_sent: false,
            emitted: false,
        }
    }

    fn needs_row_processing(&self) -> bool {
        self.analysis.as_ref().is_some_and(|a| {
            !a.aggregates.is_empty() || a.has_group_by || a.has_distinct || !a.order_by.is_empty() || a.limit.is_some()
        })
    }

    fn fail(&self, message: impl Into<String>) -> MergeError {
        let message = message.into();
        if self.emitted {
            MergeError::Fatal(message)
        } else {
            MergeError::Recoverable(ErrPacket::new(error_codes::ER_UNKNOWN_ERROR, "HY000", &message))
        }
    }

    fn check_shape(&mut self, shape: Shape) -> Result<(), MergeError> {
        match self.shape {
            None => {
                self.shape = Some(shape);
                Ok(())
            }
            Some(existing) if existing == shape => Ok(()),
            Some(_) => Err(self.fail("Shards returned results of different shape")),
        }
    }

    fn absorb_ok(&mut self, payload: &[u8]) -> Result<(), MergeError> {
        let ok = OkPacket::parse(payload).ok_or_else(|| self.fail("Malformed OK packet from backend"))?;
        if ok.status_flags & status::SERVER_MORE_RESULTS_EXISTS != 0 {
            return Err(self.fail("Multiple result sets cannot be merged"));
        }
        self.check_shape(Shape::Ok)?;
        self.affected_rows += ok.affected_rows;
        if self.last_insert_id == 0 {
            self.last_insert_id = ok.last_insert_id;
        }
        self.warnings = self.warnings.saturating_add(ok.warnings);
        self.server_status = ok.status_flags;
        Ok(())
    }

    fn absorb_rows(&mut self, payloads: Vec<Bytes>) -> Result<(), MergeError> {
        let (count, _) = read_lenenc_int(&payloads[0]).ok_or_else(|| self.fail("Malformed column count"))?;
        self.check_shape(Shape::Rows(count))?;

        // column count, definitions, EOF
        let header_len = count as usize + 2;
        if payloads.len() < header_len + 1 || !is_eof_packet(&payloads[header_len - 1]) {
            return Err(self.fail("Truncated result set from backend"));
        }
        let Some((last, body)) = payloads[header_len..].split_last() else {
            return Err(self.fail("Truncated result set from backend"));
        };
        if is_err_packet(last) {
            if let Some(err) = ErrPacket::parse(last, self.capabilities) {
                self.error.get_or_insert(err);
            }
            return Ok(());
        }
        let eof = EofPacket::parse(last).ok_or_else(|| self.fail("Result set without terminating EOF"))?;
        if eof.status_flags & status::SERVER_MORE_RESULTS_EXISTS != 0 {
            return Err(self.fail("Multiple result sets cannot be merged"));
        }
        self.warnings = self.warnings.saturating_add(eof.warnings);
        self.server_status = eof.status_flags;

        if self.header.is_empty() {
            self.header = payloads[..header_len].to_vec();
        }
        self.rows.extend(body.iter().cloned());
        Ok(())
    }

    /// Rows flow straight out, header first
    fn stream_ready(&mut self) {
        if !self.header_sent && !self.header.is_empty() {
            self.output.extend(self.header.iter().cloned());
            self.header_sent = true;
        }
        if self.header_sent {
            self.output.append(&mut self.rows);
        }
    }

    fn finish(&mut self) -> Result<(), MergeError> {
        if let Some(err) = self.error.take() {
            if self.emitted {
                return Err(MergeError::Fatal(err.error_message));
            }
            self.output.clear();
            return Err(MergeError::Recoverable(err));
        }

        let final_status = self.server_status & !status::SERVER_MORE_RESULTS_EXISTS;
        match self.shape {
            None => Err(self.fail("No response to merge")),
            Some(Shape::Ok) => {
                let ok = OkPacket {
                    affected_rows: self.affected_rows,
                    last_insert_id: self.last_insert_id,
                    status_flags: final_status,
                    warnings: self.warnings,
                };
                self.output.push(ok.encode(self.capabilities));
                Ok(())
            }
            Some(Shape::Rows(count)) => {
                if self.needs_row_processing() {
                    let rows = std::mem::take(&mut self.rows);
                    self.rows = self.process_rows(rows, count as usize)?;
                }
                self.stream_ready();
                let mut eof = EofPacket::new(final_status);
                eof.warnings = self.warnings;
                self.output.push(eof.encode());
                Ok(())
            }
        }
    }

    fn process_rows(&self, rows: Vec<Bytes>, column_count: usize) -> Result<Vec<Bytes>, MergeError> {
        let Some(analysis) = self.analysis.as_ref() else {
            return Ok(rows);
        };
        if analysis.order_by_unresolved && self.expected > 1 {
            return Err(self.fail("ORDER BY on a column outside the select list is not supported across shards"));
        }
        if let Some(agg) = analysis.aggregates.iter().find(|a| !AggregateFolder::is_mergeable(a)) {
            return Err(self.fail(format!("Aggregate {} cannot be merged across shards", agg.expr_str)));
        }

        let mut parsed = Vec::with_capacity(rows.len());
        for row in &rows {
            let cells = parse_text_row(row, column_count).ok_or_else(|| self.fail("Malformed row from backend"))?;
            parsed.push(cells);
        }

        let mut parsed = if !analysis.aggregates.is_empty() || analysis.has_group_by {
            self.fold_groups(parsed, analysis)
        } else if analysis.has_distinct {
            dedupe(parsed)
        } else {
            parsed
        };

        if !analysis.order_by.is_empty() {
            parsed.sort_by(|a, b| compare_rows(a, b, &analysis.order_by));
        }
        if let Some(limit) = analysis.limit {
            parsed = parsed
                .into_iter()
                .skip(limit.offset as usize)
                .take(limit.count as usize)
                .collect();
        }
        debug!(rows = parsed.len(), "Merged rows");
        Ok(parsed.iter().map(|cells| encode_text_row(cells)).collect())
    }

    /// Group on the non-aggregate columns and fold aggregates per group.
    /// Without GROUP BY everything is one group.
    fn fold_groups(&self, rows: Vec<Vec<Cell>>, analysis: &SqlAnalysis) -> Vec<Vec<Cell>> {
        let is_aggregate = |pos: usize| analysis.aggregates.iter().any(|a| a.position == pos);
        let mut index: HashMap<Vec<Cell>, usize> = HashMap::new();
        let mut groups: Vec<(Vec<Cell>, Vec<AggregateFolder>)> = Vec::new();

        for row in rows {
            let key: Vec<Cell> = if analysis.has_group_by {
                row.iter()
                    .enumerate()
                    .filter(|(pos, _)| !is_aggregate(*pos))
                    .map(|(_, c)| c.clone())
                    .collect()
            } else {
                Vec::new()
            };
            let slot = *index.entry(key).or_insert_with(|| {
                let folders = analysis.aggregates.iter().cloned().map(AggregateFolder::new).collect();
                groups.push((row.clone(), folders));
                groups.len() - 1
            });
            for folder in groups[slot].1.iter_mut() {
                if let Some(cell) = row.get(folder.position()) {
                    folder.fold(cell);
                }
            }
        }

        groups
            .into_iter()
            .map(|(mut template, folders)| {
                for folder in &folders {
                    if let Some(cell) = template.get_mut(folder.position()) {
                        *cell = folder.finish();
                    }
                }
                template
            })
            .collect()
    }
}

fn dedupe(rows: Vec<Vec<Cell>>) -> Vec<Vec<Cell>> {
    let mut seen = std::collections::HashSet::new();
    rows.into_iter().filter(|row| seen.insert(row.clone())).collect()
}

impl ResultMerger for ConcatMerger {
    fn push(&mut self, response: &[Packet]) -> Result<MergeStatus, MergeError> {
        self.received += 1;
        let payloads = logical_payloads(response);
        let Some(first) = payloads.first() else {
            return Err(self.fail("Empty response from backend"));
        };

        match first.first().copied() {
            None => return Err(self.fail("Empty packet from backend")),
            Some(0xFF) => {
                if let Some(err) = ErrPacket::parse(first, self.capabilities) {
                    self.error.get_or_insert(err);
                }
            }
            Some(0x00) => {
                let first = first.clone();
                self.absorb_ok(&first)?;
            }
            Some(0xFB) => return Err(self.fail("LOAD DATA LOCAL INFILE is not supported across shards")),
            _ => self.absorb_rows(payloads)?,
        }

        if self.is_streamable() && self.error.is_none() {
            self.stream_ready();
        }

        if self.received < self.expected {
            return Ok(MergeStatus::Partial);
        }
        self.finish()?;
        Ok(MergeStatus::Complete)
    }

    fn take_output(&mut self) -> Vec<Bytes> {
        let output = std::mem::take(&mut self.output);
        if !output.is_empty() {
            self.emitted = true;
        }
        output
    }

    fn is_streamable(&self) -> bool {
        !self.needs_row_processing()
    }
}
