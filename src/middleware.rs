//! HTTP middleware: rate limiting, request size limits, CORS, and security
//! headers.

use axum::{
    extract::{Request, State},
    http::{HeaderValue, Method, StatusCode},
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
    let per_minute = NonZeroU32::new(config.rate_limit_per_minute.max(1)).unwrap_or(NonZeroU32::MIN);
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
            warn!(path = %request.uri().path(), "rate limit exceeded");
            Err(StatusCode::TOO_MANY_REQUESTS)
        }
    }
}

pub async fn security_headers_middleware(
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert(
        "Referrer-Policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );

    Ok(response)
}

pub fn create_cors_layer(config: &ServerConfig) -> CorsLayer {
    if config.enable_cors {
        let mut cors = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([
                axum::http::header::AUTHORIZATION,
                axum::http::header::CONTENT_TYPE,
                axum::http::header::ACCEPT,
            ]);

        if config.cors_origins.iter().any(|origin| origin == "*") {
            cors = cors.allow_origin(Any);
        } else {
            for origin in &config.cors_origins {
                if let Ok(value) = HeaderValue::from_str(origin) {
                    cors = cors.allow_origin(value);
                }
            }
        }

        cors
    } else {
        CorsLayer::new()
    }
}

pub fn create_body_limit_layer(max_size_mb: usize) -> RequestBodyLimitLayer {
    RequestBodyLimitLayer::new(max_size_mb * 1024 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_rejects_after_quota() {
        let config = ServerConfig {
            rate_limit_per_minute: 2,
            ..ServerConfig::default()
        };
        let limiter = create_rate_limiter(&config);

        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
    }
}
