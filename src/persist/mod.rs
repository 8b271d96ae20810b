/// Relational Persistence Layer
///
/// SQLite-backed storage that lives outside the resource store:
/// - Connection and schema bootstrap
/// - Archive of completed workflows (list/get/resubmit/delete)
/// - Offloaded node status for workflows too large to pack

// Pool creation and schema
pub mod database;

// Completed-workflow archive
pub mod archive;

// Node status offload table
pub mod offload;

// Pack/offload around resource store reads and writes
pub mod status;

pub use archive::{ArchiveFilter, ArchiveRepository, ArchivedWorkflow};
pub use database::Database;
pub use offload::OffloadRepository;
pub use status::StatusPersister;
