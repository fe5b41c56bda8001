pub mod rhh;
