//! Bringing backend sessions in line with the client's connection settings.
//!
//! Before a statement is sent, every participating session must agree with
//! the client on default database, character set, multi-statement option and
//! autocommit/transaction state. Mismatches are fixed one category at a
//! time, in [`Attr::ORDER`], with one corrective command per mismatched
//! session and category.

use bytes::Bytes;
use tracing::debug;

use crate::backend::{Attr, AttrMask, BackendSession, DispatchState, SessionAttrs};
use crate::protocol::{error_codes, query_payload, set_option_payload, ErrPacket};

/// Settings the client expects every participating session to hold
#[derive(Debug, Clone, Copy)]
pub struct Wanted<'a> {
    pub attrs: &'a SessionAttrs,
    /// The client runs a plain (non-XA) explicit transaction
    pub transaction: bool,
}

impl Wanted<'_> {
    /// Categories in which `session` disagrees
    pub fn diff(&self, session: &BackendSession) -> AttrMask {
        let mut mask = AttrMask::empty();
        if let Some(db) = self.attrs.db.as_deref() {
            if session.attrs.db.as_deref() != Some(db) {
                mask.insert(Attr::DefaultDb);
            }
        }
        if !session.attrs.charset.eq_ignore_ascii_case(&self.attrs.charset) {
            mask.insert(Attr::Charset);
        }
        if session.attrs.multi_statements != self.attrs.multi_statements {
            mask.insert(Attr::MultiStatements);
        }
        let autocommit_differs = if self.transaction {
            !session.is_in_transaction()
        } else {
            session.attrs.autocommit != self.attrs.autocommit
        };
        if autocommit_differs {
            mask.insert(Attr::Autocommit);
        }
        mask
    }

    /// Command that fixes `attr` on a session
    pub fn corrective(&self, attr: Attr) -> Bytes {
        match attr {
            Attr::DefaultDb => {
                let db = self.attrs.db.as_deref().unwrap_or_default();
                query_payload(&format!("USE `{}`", db.replace('`', "``")))
            }
            Attr::Charset => query_payload(&format!("SET NAMES {}", self.attrs.charset)),
            Attr::MultiStatements => set_option_payload(self.attrs.multi_statements),
            Attr::Autocommit if self.transaction => query_payload("START TRANSACTION"),
            Attr::Autocommit => query_payload(if self.attrs.autocommit {
                "SET AUTOCOMMIT=1"
            } else {
                "SET AUTOCOMMIT=0"
            }),
        }
    }

    /// Record that the corrective command for `attr` succeeded
    pub fn apply(&self, session: &mut BackendSession, attr: Attr) {
        match attr {
            Attr::DefaultDb => session.attrs.db = self.attrs.db.clone(),
            Attr::Charset => session.attrs.charset = self.attrs.charset.clone(),
            Attr::MultiStatements => session.attrs.multi_statements = self.attrs.multi_statements,
            Attr::Autocommit if self.transaction => session.set_in_transaction(true),
            Attr::Autocommit => session.attrs.autocommit = self.attrs.autocommit,
        }
        session.attr_diff.remove(attr);
    }
}

/// Walks the attribute categories for one statement
#[derive(Debug, Default)]
pub struct Reconciler {
    current: Option<Attr>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Attr> {
        self.current
    }

    /// Corrective commands for the next mismatched category, or `None` when
    /// every participating session agrees with the client.
    pub fn next_round(&mut self, sessions: &mut [BackendSession], wanted: Wanted<'_>) -> Option<Vec<(usize, Bytes)>> {
        let mut mask = AttrMask::empty();
        for session in sessions.iter_mut().filter(|s| s.participated && !s.unavailable) {
            session.attr_diff = wanted.diff(session);
            mask = mask.union(session.attr_diff);
        }

        let attr = mask.next_after(self.current)?;
        self.current = Some(attr);
        let payload = wanted.corrective(attr);
        let commands: Vec<(usize, Bytes)> = sessions
            .iter()
            .enumerate()
            .filter(|(_, s)| s.participated && !s.unavailable && s.attr_diff.contains(attr))
            .map(|(idx, _)| (idx, payload.clone()))
            .collect();
        debug!(?attr, sessions = commands.len(), "Reconciling session attribute");
        Some(commands)
    }

    /// Check the corrective responses of `members` and record the new state.
    /// Any failure aborts the whole statement.
    pub fn finish_round(
        &self,
        sessions: &mut [BackendSession],
        members: &[usize],
        wanted: Wanted<'_>,
    ) -> Result<(), ErrPacket> {
        let Some(attr) = self.current else {
            return Ok(());
        };
        for idx in members.iter().copied() {
            let Some(session) = sessions.get_mut(idx) else {
                continue;
            };
            if session.dispatch_state() == DispatchState::Error {
                return Err(ErrPacket::new(
                    error_codes::ER_UNKNOWN_ERROR,
                    "HY000",
                    &format!("Lost backend {} while adjusting session state", session.addr()),
                ));
            }
            if let Some(err) = session.summary().and_then(|s| s.error()) {
                return Err(ErrPacket::new(
                    error_codes::ER_UNKNOWN_ERROR,
                    "HY000",
                    &format!("Failed to set {:?} on {}: {}", attr, session.addr(), err.error_message),
                ));
            }
            wanted.apply(session, attr);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Channel;
    use crate::protocol::capabilities::CLIENT_PROTOCOL_41;
    use tokio::io::duplex;

    fn session(attrs: SessionAttrs) -> BackendSession {
        let (a, _b) = duplex(64);
        let mut session = BackendSession::new(
            0,
            "db:3306",
            "app",
            Channel::new(Box::new(a), "db", 1 << 24),
            1,
            CLIENT_PROTOCOL_41,
            attrs,
            0,
        );
        session.participated = true;
        session
    }

    fn client_attrs() -> SessionAttrs {
        SessionAttrs {
            db: Some("shop".to_string()),
            ..SessionAttrs::default()
        }
    }

    #[tokio::test]
    async fn test_consistent_sessions_need_no_commands() {
        let attrs = client_attrs();
        let wanted = Wanted {
            attrs: &attrs,
            transaction: false,
        };
        let mut sessions = vec![session(attrs.clone()), session(attrs.clone())];
        let mut reconciler = Reconciler::new();
        assert!(reconciler.next_round(&mut sessions, wanted).is_none());
        assert!(sessions.iter().all(|s| !s.has_pending_writes()));
    }

    #[tokio::test]
    async fn test_only_mismatched_session_is_corrected() {
        let attrs = client_attrs();
        let wanted = Wanted {
            attrs: &attrs,
            transaction: false,
        };
        let stale = SessionAttrs {
            db: Some("other".to_string()),
            ..SessionAttrs::default()
        };
        let mut sessions = vec![session(attrs.clone()), session(stale)];
        let mut reconciler = Reconciler::new();

        let commands = reconciler.next_round(&mut sessions, wanted).unwrap();
        assert_eq!(commands, vec![(1, query_payload("USE `shop`"))]);
        assert_eq!(reconciler.current(), Some(Attr::DefaultDb));

        reconciler.finish_round(&mut sessions, &[1], wanted).unwrap();
        assert_eq!(sessions[1].attrs.db.as_deref(), Some("shop"));
        assert!(reconciler.next_round(&mut sessions, wanted).is_none());
    }

    #[tokio::test]
    async fn test_categories_run_in_order() {
        let attrs = SessionAttrs {
            charset: "latin1".to_string(),
            autocommit: false,
            ..client_attrs()
        };
        let wanted = Wanted {
            attrs: &attrs,
            transaction: false,
        };
        let mut sessions = vec![session(SessionAttrs::default())];
        let mut reconciler = Reconciler::new();

        let mut seen = Vec::new();
        while let Some(commands) = reconciler.next_round(&mut sessions, wanted) {
            seen.push(commands[0].1.clone());
            reconciler.finish_round(&mut sessions, &[0], wanted).unwrap();
        }
        assert_eq!(
            seen,
            vec![
                query_payload("USE `shop`"),
                query_payload("SET NAMES latin1"),
                query_payload("SET AUTOCOMMIT=0"),
            ]
        );
    }

    #[tokio::test]
    async fn test_transaction_started_on_joining_session() {
        let attrs = client_attrs();
        let wanted = Wanted {
            attrs: &attrs,
            transaction: true,
        };
        let mut sessions = vec![session(attrs.clone())];
        let mut reconciler = Reconciler::new();
        let commands = reconciler.next_round(&mut sessions, wanted).unwrap();
        assert_eq!(commands[0].1, query_payload("START TRANSACTION"));
        reconciler.finish_round(&mut sessions, &[0], wanted).unwrap();
        assert!(sessions[0].is_in_transaction());
    }

    #[test]
    fn test_backtick_in_database_is_escaped() {
        let attrs = SessionAttrs {
            db: Some("we`ird".to_string()),
            ..SessionAttrs::default()
        };
        let wanted = Wanted {
            attrs: &attrs,
            transaction: false,
        };
        assert_eq!(wanted.corrective(Attr::DefaultDb), query_payload("USE `we``ird`"));
    }
}
