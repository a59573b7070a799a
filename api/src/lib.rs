//! HTTP admin surface for one node: health, status and the HA controls.

mod error;
mod handlers;
mod server;

pub use error::{ApiError, ApiResult};
pub use handlers::AppState;
pub use server::{router, Server};
