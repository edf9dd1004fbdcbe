//! Incremental parsing of server responses.
//!
//! A [`ResultParser`] is fed one physical packet at a time and reports when
//! the response to a command is complete: a single OK/ERR, or a full result
//! set (column count, column definitions, EOF, rows, terminal EOF/ERR),
//! repeated while the server flags `SERVER_MORE_RESULTS_EXISTS`.

use super::handshake::{is_eof_packet, is_err_packet, EofPacket, ErrPacket, OkPacket};
use super::packet::{capabilities::CLIENT_PROTOCOL_41, read_lenenc_int, status, Command, Packet};

/// Shape of the response a command produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// COM_QUERY: OK/ERR or text result sets, possibly several
    Query,
    /// COM_STMT_EXECUTE: OK/ERR or binary result sets
    StmtExecute,
    /// COM_STMT_PREPARE: prepare-OK followed by param and column definitions
    StmtPrepare,
    /// COM_FIELD_LIST: column definitions terminated by EOF
    FieldList,
    /// COM_SET_OPTION: a single EOF (or ERR)
    SetOption,
    /// Everything else: a single OK/ERR
    Simple,
}

impl ResponseKind {
    pub fn for_command(cmd: Command) -> Self {
        match cmd {
            Command::Query => ResponseKind::Query,
            Command::StmtExecute | Command::StmtFetch => ResponseKind::StmtExecute,
            Command::StmtPrepare => ResponseKind::StmtPrepare,
            Command::FieldList => ResponseKind::FieldList,
            Command::SetOption => ResponseKind::SetOption,
            _ => ResponseKind::Simple,
        }
    }

    /// Responses that may carry rows and are eligible for row merging
    pub fn carries_rows(&self) -> bool {
        matches!(self, ResponseKind::Query | ResponseKind::StmtExecute)
    }
}

/// Terminal status of a finished response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    Err(ErrPacket),
    /// LOCAL INFILE request; the proxy does not relay file contents
    LocalInfile,
}

/// Summary captured while parsing one response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultSummary {
    pub status: ResponseStatus,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub warnings: u16,
    pub server_status: u16,
    /// Column count of the first result set, if any
    pub column_count: Option<u64>,
    pub rows: u64,
    pub result_sets: u32,
    /// Statement id from a prepare-OK
    pub statement_id: Option<u32>,
}

impl Default for ResultSummary {
    fn default() -> Self {
        Self {
            status: ResponseStatus::Ok,
            affected_rows: 0,
            last_insert_id: 0,
            warnings: 0,
            server_status: 0,
            column_count: None,
            rows: 0,
            result_sets: 0,
            statement_id: None,
        }
    }
}

impl ResultSummary {
    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    pub fn error(&self) -> Option<&ErrPacket> {
        match &self.status {
            ResponseStatus::Err(err) => Some(err),
            _ => None,
        }
    }

    pub fn has_resultset(&self) -> bool {
        self.column_count.is_some()
    }
}

/// Errors raised on packets that do not fit the response grammar
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResultError {
    #[error("Empty packet in response")]
    EmptyPacket,
    #[error("Malformed {0} packet")]
    Malformed(&'static str),
    #[error("Unexpected packet 0x{byte:02x} while expecting {expected}")]
    Unexpected { byte: u8, expected: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for the first packet of a (next) result
    Start,
    Columns(u64),
    ColumnsEof,
    Rows,
    PrepareParams(u64),
    PrepareParamsEof,
    PrepareColumns(u64),
    PrepareColumnsEof,
    FieldList,
    Done,
}

/// Progress reported after each packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    NeedMore,
    Finished,
}

/// Incremental response parser
#[derive(Debug, Clone)]
pub struct ResultParser {
    kind: ResponseKind,
    phase: Phase,
    /// Next physical frame continues the current logical packet
    continuation: bool,
    prepare_columns: u64,
    summary: ResultSummary,
}

impl ResultParser {
    pub fn new(kind: ResponseKind) -> Self {
        let phase = if kind == ResponseKind::FieldList {
            Phase::FieldList
        } else {
            Phase::Start
        };
        Self {
            kind,
            phase,
            continuation: false,
            prepare_columns: 0,
            summary: ResultSummary::default(),
        }
    }

    pub fn kind(&self) -> ResponseKind {
        self.kind
    }

    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn summary(&self) -> &ResultSummary {
        &self.summary
    }

    pub fn into_summary(self) -> ResultSummary {
        self.summary
    }

    /// Feed one physical packet
    pub fn feed(&mut self, packet: &Packet) -> Result<Progress, ResultError> {
        if self.phase == Phase::Done {
            return Err(ResultError::Unexpected {
                byte: packet.first_byte().unwrap_or(0),
                expected: "end of response",
            });
        }

        if self.continuation {
            self.continuation = packet.has_continuation();
            return Ok(Progress::NeedMore);
        }
        self.continuation = packet.has_continuation();

        let payload = &packet.payload[..];
        let first = *payload.first().ok_or(ResultError::EmptyPacket)?;

        match self.phase {
            Phase::Start => self.on_first_packet(first, payload)?,
            Phase::Columns(remaining) => {
                self.phase = if remaining > 1 {
                    Phase::Columns(remaining - 1)
                } else {
                    Phase::ColumnsEof
                };
            }
            Phase::ColumnsEof => {
                if !is_eof_packet(payload) {
                    return Err(ResultError::Unexpected {
                        byte: first,
                        expected: "EOF after column definitions",
                    });
                }
                self.phase = Phase::Rows;
            }
            Phase::Rows => {
                if is_eof_packet(payload) {
                    let eof = EofPacket::parse(payload).ok_or(ResultError::Malformed("EOF"))?;
                    self.summary.warnings = self.summary.warnings.saturating_add(eof.warnings);
                    self.end_of_result(eof.status_flags);
                } else if is_err_packet(payload) {
                    self.finish_with_error(payload)?;
                } else {
                    self.summary.rows += 1;
                }
            }
            Phase::PrepareParams(remaining) => {
                self.phase = if remaining > 1 {
                    Phase::PrepareParams(remaining - 1)
                } else {
                    Phase::PrepareParamsEof
                };
            }
            Phase::PrepareParamsEof => {
                if !is_eof_packet(payload) {
                    return Err(ResultError::Unexpected {
                        byte: first,
                        expected: "EOF after parameter definitions",
                    });
                }
                self.phase = self.after_prepare_params();
            }
            Phase::PrepareColumns(remaining) => {
                self.phase = if remaining > 1 {
                    Phase::PrepareColumns(remaining - 1)
                } else {
                    Phase::PrepareColumnsEof
                };
            }
            Phase::PrepareColumnsEof => {
                if !is_eof_packet(payload) {
                    return Err(ResultError::Unexpected {
                        byte: first,
                        expected: "EOF after prepared column definitions",
                    });
                }
                self.phase = Phase::Done;
            }
            Phase::FieldList => {
                if is_eof_packet(payload) {
                    self.phase = Phase::Done;
                } else if is_err_packet(payload) {
                    self.finish_with_error(payload)?;
                }
            }
            Phase::Done => unreachable!("checked above"),
        }

        Ok(if self.phase == Phase::Done {
            Progress::Finished
        } else {
            Progress::NeedMore
        })
    }

    fn on_first_packet(&mut self, first: u8, payload: &[u8]) -> Result<(), ResultError> {
        match first {
            0xFF => self.finish_with_error(payload)?,
            0x00 if self.kind == ResponseKind::StmtPrepare => {
                // status, stmt_id(4), columns(2), params(2), filler, warnings(2)
                if payload.len() < 9 {
                    return Err(ResultError::Malformed("prepare OK"));
                }
                self.summary.statement_id =
                    Some(u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]));
                let columns = u16::from_le_bytes([payload[5], payload[6]]) as u64;
                let params = u16::from_le_bytes([payload[7], payload[8]]) as u64;
                self.prepare_columns = columns;
                self.phase = if params > 0 {
                    Phase::PrepareParams(params)
                } else {
                    self.after_prepare_params()
                };
            }
            0x00 => {
                let ok = OkPacket::parse(payload).ok_or(ResultError::Malformed("OK"))?;
                self.summary.affected_rows += ok.affected_rows;
                if ok.last_insert_id != 0 {
                    self.summary.last_insert_id = ok.last_insert_id;
                }
                self.summary.warnings = self.summary.warnings.saturating_add(ok.warnings);
                self.end_of_result(ok.status_flags);
            }
            0xFE if self.kind == ResponseKind::SetOption && is_eof_packet(payload) => {
                let eof = EofPacket::parse(payload).ok_or(ResultError::Malformed("EOF"))?;
                self.summary.server_status = eof.status_flags;
                self.phase = Phase::Done;
            }
            0xFB => {
                self.summary.status = ResponseStatus::LocalInfile;
                self.phase = Phase::Done;
            }
            _ if self.kind.carries_rows() => {
                let (count, _) =
                    read_lenenc_int(payload).ok_or(ResultError::Malformed("column count"))?;
                if count == 0 {
                    return Err(ResultError::Malformed("column count"));
                }
                if self.summary.column_count.is_none() {
                    self.summary.column_count = Some(count);
                }
                self.phase = Phase::Columns(count);
            }
            _ => {
                return Err(ResultError::Unexpected {
                    byte: first,
                    expected: "OK or ERR",
                })
            }
        }
        Ok(())
    }

    fn after_prepare_params(&self) -> Phase {
        if self.prepare_columns > 0 {
            Phase::PrepareColumns(self.prepare_columns)
        } else {
            Phase::Done
        }
    }

    fn end_of_result(&mut self, server_status: u16) {
        self.summary.result_sets += 1;
        self.summary.server_status = server_status;
        self.phase = if server_status & status::SERVER_MORE_RESULTS_EXISTS != 0 {
            Phase::Start
        } else {
            Phase::Done
        };
    }

    fn finish_with_error(&mut self, payload: &[u8]) -> Result<(), ResultError> {
        let err = ErrPacket::parse(payload, CLIENT_PROTOCOL_41).ok_or(ResultError::Malformed("ERR"))?;
        self.summary.status = ResponseStatus::Err(err);
        self.phase = Phase::Done;
        Ok(())
    }
}
