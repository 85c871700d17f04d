pub mod reader;
pub mod tee;
