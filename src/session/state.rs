//! Protocol states of a client connection and what a handler asks the
//! driver to do next.

use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConState {
    Init,
    ConnectServer,
    SendHandshake,
    ReadAuth,
    SendAuthResult,
    ReadQuery,
    /// Waiting for backend sessions of the routed statement
    GetServerConnection,
    /// Bringing participating sessions in line with the client's attributes
    AdjustAttrs,
    XaStart,
    SendQuery,
    ReadQueryResult,
    ReadMultiQueryResult,
    SendQueryResult,
    /// Commit or rollback sequence of a distributed transaction
    XaCommit,
    SendError,
    Error,
    CloseClient,
    CloseServer,
    ClientQuit,
}

impl ConState {
    /// States after which the connection only winds down
    pub fn is_closing(self) -> bool {
        matches!(
            self,
            ConState::Error | ConState::CloseClient | ConState::CloseServer | ConState::ClientQuit
        )
    }
}

impl fmt::Display for ConState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConState::Init => "INIT",
            ConState::ConnectServer => "CONNECT_SERVER",
            ConState::SendHandshake => "SEND_HANDSHAKE",
            ConState::ReadAuth => "READ_AUTH",
            ConState::SendAuthResult => "SEND_AUTH_RESULT",
            ConState::ReadQuery => "READ_QUERY",
            ConState::GetServerConnection => "GET_SERVER_CONNECTION",
            ConState::AdjustAttrs => "ADJUST_ATTRS",
            ConState::XaStart => "XA_START",
            ConState::SendQuery => "SEND_QUERY",
            ConState::ReadQueryResult => "READ_QUERY_RESULT",
            ConState::ReadMultiQueryResult => "READ_MULTI_QUERY_RESULT",
            ConState::SendQueryResult => "SEND_QUERY_RESULT",
            ConState::XaCommit => "XA_COMMIT",
            ConState::SendError => "SEND_ERROR",
            ConState::Error => "ERROR",
            ConState::CloseClient => "CLOSE_CLIENT",
            ConState::CloseServer => "CLOSE_SERVER",
            ConState::ClientQuit => "CLIENT_QUIT",
        };
        f.write_str(name)
    }
}

/// I/O the driver performs before running the handler again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitFor {
    ClientRead,
    ClientWrite,
    /// Flush every session with queued bytes
    BackendWrite,
    /// Read from whichever session with a pending response answers first
    BackendRead,
    /// Check out the sessions the connection is missing
    Checkout,
    /// Sleep for the whole duration, then run the timeout handler
    Timer,
}

/// What a state handler asks of the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Run the handler of another state right away
    Goto(ConState),
    /// Suspend on I/O; the handler runs again afterwards, or the timeout
    /// handler when the budget runs out
    Wait(WaitFor, Duration),
    /// Connection is done
    Close,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closing_states() {
        assert!(ConState::CloseServer.is_closing());
        assert!(ConState::Error.is_closing());
        assert!(!ConState::SendError.is_closing());
        assert!(!ConState::ReadQuery.is_closing());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(ConState::ReadMultiQueryResult.to_string(), "READ_MULTI_QUERY_RESULT");
        assert_eq!(ConState::XaCommit.to_string(), "XA_COMMIT");
    }
}
