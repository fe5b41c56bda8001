#[macro_use]
extern crate lazy_static;

pub mod block;
pub mod codec;
pub mod compact;
pub mod config;
pub mod dbrp;
pub mod error;
pub mod file_set;
pub mod index;
pub mod index_file;
pub mod iterator;
pub mod log_file;
pub mod measurement_block;
pub mod partition;
pub mod series;
pub mod series_id_set;
pub mod tag_block;

/// Identifier assigned to a series the first time its key is seen. Zero is
/// reserved as "no series" and never issued.
pub type SeriesId = u64;

pub use crate::config::IndexConfig;
pub use crate::error::{IndexError, Result};
pub use crate::index::Index;
pub use crate::series::SeriesFile;
pub use crate::series_id_set::SeriesIdSet;
