use crate::parser::StatementType;

/// Which backend role a statement may run on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    /// Read-write backend (writes, transactions, anything stateful)
    Rw,
    /// A read-only replica, falling back to the rw backend
    Ro,
}

/// Read-write splitter
pub struct RwSplitter;

impl RwSplitter {
    /// Reads outside a transaction may go to a replica; everything else
    /// runs on the group's rw backend.
    pub fn route(stmt_type: StatementType, in_transaction: bool) -> RouteTarget {
        if in_transaction {
            return RouteTarget::Rw;
        }

        match stmt_type {
            StatementType::Select | StatementType::Show => RouteTarget::Ro,

            StatementType::Insert
            | StatementType::Replace
            | StatementType::Update
            | StatementType::Delete
            | StatementType::Ddl
            | StatementType::Begin
            | StatementType::Commit
            | StatementType::Rollback => RouteTarget::Rw,

            StatementType::Set | StatementType::Use | StatementType::Other => RouteTarget::Rw,
        }
    }
}
