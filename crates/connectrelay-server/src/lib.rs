//! ConnectRelay HTTP host — serves the relay to the extension shim and the web app.

pub mod routes;
pub mod state;

pub use routes::build_router;
pub use state::AppState;
