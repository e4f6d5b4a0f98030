// Watchflow storage: the typed repository
//
// The repository is the only component that writes to durable storage.
// Every mutation publishes a typed event on the bus after the transaction
// commits; consumers treat those events as hints, never as the source of
// truth.

mod error;
mod memory;
mod postgres;
mod repository;

pub use error::StorageError;
pub use memory::InMemoryRepository;
pub use postgres::PostgresRepository;
pub use repository::{ChangeFilter, NewRun, Repository, RunFilter, MAX_PAGE_SIZE};
