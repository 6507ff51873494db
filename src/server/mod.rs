mod archive;
mod handlers;
mod listing;
mod path_item;
mod resolve;
mod response_utils;

pub use handlers::Server;
pub use response_utils::Response;
