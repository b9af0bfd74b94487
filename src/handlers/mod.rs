pub mod health_handlers;
pub mod tus_handlers;
pub mod tus_headers;
