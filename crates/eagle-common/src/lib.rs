pub mod bounded;
pub mod error;
pub mod upstream;
