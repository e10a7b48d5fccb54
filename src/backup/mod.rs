pub(crate) mod archive; // Zip packaging of the staging directory
pub(crate) mod db_dump; // Database enumeration and pg_dump execution
pub(crate) mod encrypt; // Optional GPG encryption of the archive
mod logic;
pub(crate) mod retention; // Purging backups beyond the retention count

pub use logic::{Pipeline, RunOutcome};
