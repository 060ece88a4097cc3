pub mod keys;
pub mod merkle;
