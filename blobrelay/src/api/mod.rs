//! HTTP layer for both services.
//!
//! - [`handlers::upload`]: multipart file upload into blob storage
//! - [`handlers::notifications`]: push-delivered blob-created events

pub mod handlers;
