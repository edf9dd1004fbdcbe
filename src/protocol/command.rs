use bytes::Bytes;

use super::packet::Command;

/// Parsed command from client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Query(String),
    InitDb(String),
    Quit,
    Ping,
    FieldList { table: String, wildcard: String },
    StmtPrepare(String),
    StmtExecute { statement_id: u32 },
    StmtSendLongData { statement_id: u32 },
    StmtClose { statement_id: u32 },
    StmtReset { statement_id: u32 },
    /// COM_SET_OPTION: 0 enables multi statements, 1 disables them
    SetOption(u16),
    ResetConnection,
    Other(Command, Bytes),
}

impl ClientCommand {
    /// Parse command from packet payload
    pub fn parse(payload: &Bytes) -> Self {
        if payload.is_empty() {
            return ClientCommand::Other(Command::Unknown, Bytes::new());
        }

        let cmd = Command::from(payload[0]);
        let data = payload.slice(1..);

        match cmd {
            Command::Query => ClientCommand::Query(String::from_utf8_lossy(&data).to_string()),
            Command::InitDb => ClientCommand::InitDb(String::from_utf8_lossy(&data).to_string()),
            Command::Quit => ClientCommand::Quit,
            Command::Ping => ClientCommand::Ping,
            Command::FieldList => {
                // Table name is null-terminated, followed by optional wildcard
                let null_pos = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                let table = String::from_utf8_lossy(&data[..null_pos]).to_string();
                let wildcard = if null_pos + 1 < data.len() {
                    String::from_utf8_lossy(&data[null_pos + 1..]).to_string()
                } else {
                    String::new()
                };
                ClientCommand::FieldList { table, wildcard }
            }
            Command::StmtPrepare => {
                ClientCommand::StmtPrepare(String::from_utf8_lossy(&data).to_string())
            }
            Command::StmtExecute => ClientCommand::StmtExecute {
                statement_id: read_u32(&data),
            },
            Command::StmtSendLongData => ClientCommand::StmtSendLongData {
                statement_id: read_u32(&data),
            },
            Command::StmtClose => ClientCommand::StmtClose {
                statement_id: read_u32(&data),
            },
            Command::StmtReset => ClientCommand::StmtReset {
                statement_id: read_u32(&data),
            },
            Command::SetOption if data.len() >= 2 => {
                ClientCommand::SetOption(u16::from_le_bytes([data[0], data[1]]))
            }
            Command::ResetConnection => ClientCommand::ResetConnection,
            _ => ClientCommand::Other(cmd, data),
        }
    }

    /// The command byte this command travels with
    pub fn command(&self) -> Command {
        match self {
            ClientCommand::Query(_) => Command::Query,
            ClientCommand::InitDb(_) => Command::InitDb,
            ClientCommand::Quit => Command::Quit,
            ClientCommand::Ping => Command::Ping,
            ClientCommand::FieldList { .. } => Command::FieldList,
            ClientCommand::StmtPrepare(_) => Command::StmtPrepare,
            ClientCommand::StmtExecute { .. } => Command::StmtExecute,
            ClientCommand::StmtSendLongData { .. } => Command::StmtSendLongData,
            ClientCommand::StmtClose { .. } => Command::StmtClose,
            ClientCommand::StmtReset { .. } => Command::StmtReset,
            ClientCommand::SetOption(_) => Command::SetOption,
            ClientCommand::ResetConnection => Command::ResetConnection,
            ClientCommand::Other(cmd, _) => *cmd,
        }
    }
}

fn read_u32(data: &[u8]) -> u32 {
    if data.len() < 4 {
        return 0;
    }
    u32::from_le_bytes([data[0], data[1], data[2], data[3]])
}

/// Build a COM_QUERY payload
pub fn query_payload(sql: &str) -> Bytes {
    let mut payload = Vec::with_capacity(sql.len() + 1);
    payload.push(Command::Query as u8);
    payload.extend_from_slice(sql.as_bytes());
    Bytes::from(payload)
}

/// Build a COM_SET_OPTION payload
pub fn set_option_payload(multi_statements: bool) -> Bytes {
    // MYSQL_OPTION_MULTI_STATEMENTS_ON = 0, _OFF = 1
    let option: u16 = if multi_statements { 0 } else { 1 };
    let mut payload = vec![Command::SetOption as u8];
    payload.extend_from_slice(&option.to_le_bytes());
    Bytes::from(payload)
}

/// Session-level statements the proxy handles itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKind {
    Begin,
    Commit,
    Rollback,
    SetAutocommit(bool),
    SetNames(String),
    Use(String),
    Other,
}

/// Leading keyword patterns, matched against the first tokens of a query
const KEYWORD_TABLE: &[(&[&str], fn(&[String]) -> Option<QueryKind>)] = &[
    (&["BEGIN"], begin_kind),
    (&["START", "TRANSACTION"], begin_kind),
    (&["COMMIT"], commit_kind),
    (&["ROLLBACK"], rollback_kind),
    (&["SET", "NAMES"], set_names_kind),
    (&["SET"], set_autocommit_kind),
    (&["USE"], use_kind),
];

/// Classify a COM_QUERY statement by its leading tokens
pub fn classify_query(sql: &str) -> QueryKind {
    let tokens = leading_tokens(sql, 6);
    for (prefix, build) in KEYWORD_TABLE {
        if tokens.len() >= prefix.len()
            && prefix
                .iter()
                .zip(tokens.iter())
                .all(|(kw, tok)| tok.eq_ignore_ascii_case(kw))
        {
            if let Some(kind) = build(&tokens[prefix.len()..]) {
                return kind;
            }
        }
    }
    QueryKind::Other
}

fn begin_kind(_rest: &[String]) -> Option<QueryKind> {
    Some(QueryKind::Begin)
}

fn commit_kind(rest: &[String]) -> Option<QueryKind> {
    match rest.first() {
        None => Some(QueryKind::Commit),
        Some(t) if t.eq_ignore_ascii_case("WORK") => Some(QueryKind::Commit),
        _ => None,
    }
}

fn rollback_kind(rest: &[String]) -> Option<QueryKind> {
    // ROLLBACK TO SAVEPOINT stays with the backend
    match rest.first() {
        None => Some(QueryKind::Rollback),
        Some(t) if t.eq_ignore_ascii_case("WORK") && rest.len() == 1 => Some(QueryKind::Rollback),
        _ => None,
    }
}

fn set_names_kind(rest: &[String]) -> Option<QueryKind> {
    let charset = rest.first()?.trim_matches(|c| c == '\'' || c == '"' || c == '`');
    if charset.is_empty() {
        return None;
    }
    Some(QueryKind::SetNames(charset.to_ascii_lowercase()))
}

fn set_autocommit_kind(rest: &[String]) -> Option<QueryKind> {
    // SET [SESSION|@@SESSION.|@@]autocommit = value
    let mut iter = rest.iter().peekable();
    if iter
        .peek()
        .is_some_and(|t| t.eq_ignore_ascii_case("SESSION") || t.eq_ignore_ascii_case("LOCAL"))
    {
        iter.next();
    }
    let name = iter.next()?.to_ascii_lowercase();
    let name = name
        .trim_start_matches("@@session.")
        .trim_start_matches("@@local.")
        .trim_start_matches("@@");
    if name != "autocommit" {
        return None;
    }
    if iter.next()? != "=" {
        return None;
    }
    let value = iter.next()?.to_ascii_uppercase();
    if iter.next().is_some() {
        return None;
    }
    match value.trim_matches('\'') {
        "1" | "ON" | "TRUE" => Some(QueryKind::SetAutocommit(true)),
        "0" | "OFF" | "FALSE" => Some(QueryKind::SetAutocommit(false)),
        _ => None,
    }
}

fn use_kind(rest: &[String]) -> Option<QueryKind> {
    if rest.len() != 1 {
        return None;
    }
    let db = rest[0].trim_matches('`');
    if db.is_empty() {
        return None;
    }
    Some(QueryKind::Use(db.to_string()))
}

/// Split the head of a statement into tokens, skipping comments.
///
/// `=` is always its own token and a trailing `;` is dropped.
fn leading_tokens(sql: &str, limit: usize) -> Vec<String> {
    let mut tokens = Vec::new();
    let bytes = sql.as_bytes();
    let mut i = 0;

    while i < bytes.len() && tokens.len() < limit {
        let c = bytes[i];
        if c.is_ascii_whitespace() || c == b';' {
            i += 1;
        } else if c == b'/' && bytes.get(i + 1) == Some(&b'*') {
            match sql[i + 2..].find("*/") {
                Some(end) => i += end + 4,
                None => break,
            }
        } else if (c == b'-' && bytes.get(i + 1) == Some(&b'-')) || c == b'#' {
            match sql[i..].find('\n') {
                Some(end) => i += end + 1,
                None => break,
            }
        } else if c == b'=' {
            tokens.push("=".to_string());
            i += 1;
        } else {
            let start = i;
            while i < bytes.len()
                && !bytes[i].is_ascii_whitespace()
                && bytes[i] != b'='
                && bytes[i] != b';'
            {
                i += 1;
            }
            tokens.push(sql[start..i].to_string());
        }
    }

    tokens
}
