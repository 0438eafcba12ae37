pub mod buf_ext;
pub mod error;
pub mod log_level;
