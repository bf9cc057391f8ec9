// API处理器模块

pub mod status;
pub mod tus;

pub use status::*;
pub use tus::*;
