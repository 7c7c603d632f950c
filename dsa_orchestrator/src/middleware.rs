//! HTTP middleware: rate limiting, body size limits, CORS and response headers.

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::Response,
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::{num::NonZeroU32, sync::Arc};
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
};
use tracing::warn;

use crate::settings::ServerConfig;

pub type AppRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub fn create_rate_limiter(config: &ServerConfig) -> Arc<AppRateLimiter> {
    let per_minute = NonZeroU32::new(config.rate_limit_per_minute).unwrap_or(NonZeroU32::MIN);
    Arc::new(RateLimiter::direct(Quota::per_minute(per_minute)))
}

pub async fn rate_limit_middleware(
    State(rate_limiter): State<Arc<AppRateLimiter>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    match rate_limiter.check() {
        Ok(_) => Ok(next.run(request).await),
        Err(_) => {
            warn!("Rate limit exceeded for request to {}", request.uri().path());
            Err(StatusCode::TOO_MANY_REQUESTS)
        }
    }
}

pub async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    response
}

/// `["*"]` allows any origin; an empty list allows none.
pub fn create_cors_layer(config: &ServerConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    if config.cors_origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();
    cors.allow_origin(origins)
}

pub fn create_body_limit_layer(config: &ServerConfig) -> RequestBodyLimitLayer {
    RequestBodyLimitLayer::new(config.max_request_size_kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter() {
        let config = ServerConfig {
            rate_limit_per_minute: 2,
            ..Default::default()
        };
        let rate_limiter = create_rate_limiter(&config);

        assert!(rate_limiter.check().is_ok());
        assert!(rate_limiter.check().is_ok());
        assert!(rate_limiter.check().is_err());
    }

    #[test]
    fn test_zero_rate_falls_back_to_one() {
        let config = ServerConfig {
            rate_limit_per_minute: 0,
            ..Default::default()
        };
        let rate_limiter = create_rate_limiter(&config);
        assert!(rate_limiter.check().is_ok());
        assert!(rate_limiter.check().is_err());
    }
}
