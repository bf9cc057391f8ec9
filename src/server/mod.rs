// Web服务器模块

pub mod handlers;
pub mod paths;
pub mod protocol;
pub mod state;

pub use state::AppState;
