pub mod common;
pub mod replay;
pub mod stream;
