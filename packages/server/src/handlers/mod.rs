pub mod file;
pub mod receipt;
