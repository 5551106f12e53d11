pub mod message;

/// The two tables a message can live in. Both share the same columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    /// Messages waiting for, or undergoing, processing.
    Pending,
    /// Messages that reached a terminal outcome.
    Archive,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Pending => "messages",
            Table::Archive => "archived_messages",
        }
    }
}
