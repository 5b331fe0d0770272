pub mod builder;
pub mod cors;
pub mod handler;
pub mod listener;

pub use builder::{PeerService, ServerBuilder};
pub use cors::CorsPolicy;
pub use handler::RequestHandler;
