pub mod receipt;
pub mod shared;
