pub mod server;
pub mod state;

pub use server::{ErrorResponse, create_router};
pub use state::AppState;
