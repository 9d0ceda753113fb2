//! Command Error Types

use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[display("configuration error")]
    Config,
    /// Opening, migrating or seeding the store failed.
    #[display("store setup failed")]
    Setup,
    #[display("query failed")]
    Query,
    #[display("benchmark {_0} failed")]
    Bench(#[error(not(source))] String),
}
