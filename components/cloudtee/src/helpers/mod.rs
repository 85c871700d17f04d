pub mod async_read;
pub mod load_config;
pub mod naming;
