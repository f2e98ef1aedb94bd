pub mod digest;
pub mod keys;
pub mod token;
