pub mod iterator;
pub mod tag;
