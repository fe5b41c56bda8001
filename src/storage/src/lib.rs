pub mod mmap;
pub mod writer;

pub use mmap::MmapFile;
pub use writer::{install_file, sync_dir, FileWriter, TMP_FILE_SUFFIX};
