pub mod config;
pub mod error;
pub mod phone;

pub use error::{AppError, Result};
