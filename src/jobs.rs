//! The batch jobs behind each subcommand. Each one only knows how to prepare and write a single
//! record; paging, transactions and checkpoints are handled by `batch`.

pub mod enrich;
pub mod images;
pub mod import;
pub mod textify;
