//! HTTP adapter: caller key extraction, the rate limiting middleware and the
//! admission server.

mod extractor;
mod middleware;
mod server;

pub use extractor::{HeaderKeyExtractor, KeyExtractor};
pub use middleware::{
    rate_limit, RateLimitState, EXPIRES_AT_HEADER, STATE_HEADER, TOTAL_REQUESTS_HEADER,
};
pub use server::HttpServer;
