//! Response hardening headers and per-client request rate limiting for the HTTP surface.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
    Router,
};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::debug;

use crate::config::RateLimit;
use crate::error::ApiError;

/// Set on every response that does not already carry them.
pub const SECURITY_HEADERS: &[(&str, &str)] = &[
    (
        "content-security-policy",
        "default-src 'self';base-uri 'self';font-src 'self' https: data:;form-action 'self';\
         frame-ancestors 'self';img-src 'self' data:;object-src 'none';script-src 'self';\
         script-src-attr 'none';style-src 'self' https: 'unsafe-inline';upgrade-insecure-requests",
    ),
    ("cross-origin-opener-policy", "same-origin"),
    ("cross-origin-resource-policy", "same-origin"),
    ("origin-agent-cluster", "?1"),
    ("referrer-policy", "no-referrer"),
    ("strict-transport-security", "max-age=15552000; includeSubDomains"),
    ("x-content-type-options", "nosniff"),
    ("x-dns-prefetch-control", "off"),
    ("x-download-options", "noopen"),
    ("x-frame-options", "SAMEORIGIN"),
    ("x-permitted-cross-domain-policies", "none"),
    ("x-xss-protection", "0"),
];

/// Wrap `router` so every response carries [`SECURITY_HEADERS`].
pub fn with_security_headers<S>(router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    SECURITY_HEADERS.iter().fold(router, |router, &(name, value)| {
        router.layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        ))
    })
}

/// Request budget per client address, refilled evenly over the window.
pub struct RequestLimiter {
    limiter: DefaultKeyedRateLimiter<IpAddr>,
    clock: DefaultClock,
    limit: RateLimit,
}

impl RequestLimiter {
    pub fn new(limit: RateLimit) -> Self {
        let burst = NonZeroU32::new(limit.requests.max(1)).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(limit.window / burst.get())
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);
        Self {
            limiter: RateLimiter::keyed(quota),
            clock: DefaultClock::default(),
            limit,
        }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Spend one request for `client`, or say how long until the next one is allowed.
    pub fn check(&self, client: IpAddr) -> Result<(), ApiError> {
        self.limiter.check_key(&client).map_err(|not_until| {
            let wait = not_until.wait_time_from(self.clock.now());
            ApiError::TooManyRequests {
                retry_after_secs: ceil_secs(wait).max(1),
            }
        })
    }

    /// Drop state for clients whose budget is full again.
    pub fn forget_idle(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }

    pub fn tracked_clients(&self) -> usize {
        self.limiter.len()
    }
}

fn ceil_secs(wait: Duration) -> u64 {
    wait.as_secs() + u64::from(wait.subsec_nanos() > 0)
}

/// Per-address rate limiting. Connections served without peer info share one budget.
pub async fn rate_limit(
    State(limiter): State<Arc<RequestLimiter>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let client = connect_info
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    if let Err(e) = limiter.check(client) {
        debug!(client = %client, path = %request.uri().path(), "Request over budget");
        return Err(e);
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(requests: u32, window_secs: u64) -> RequestLimiter {
        RequestLimiter::new(RateLimit {
            requests,
            window: Duration::from_secs(window_secs),
        })
    }

    #[test]
    fn budget_is_per_client() {
        let limiter = limiter(2, 900);
        let a = IpAddr::from([10, 0, 0, 1]);
        let b = IpAddr::from([10, 0, 0, 2]);

        assert!(limiter.check(a).is_ok());
        assert!(limiter.check(a).is_ok());
        assert!(limiter.check(a).is_err());
        assert!(limiter.check(b).is_ok());
        assert_eq!(limiter.tracked_clients(), 2);
    }

    #[test]
    fn rejection_reports_wait_until_next_slot() {
        let limiter = limiter(1, 900);
        let client = IpAddr::from([10, 0, 0, 3]);

        limiter.check(client).unwrap();
        match limiter.check(client) {
            Err(ApiError::TooManyRequests { retry_after_secs }) => {
                assert!((890..=900).contains(&retry_after_secs), "{}", retry_after_secs)
            }
            other => panic!("expected rate limit, got {:?}", other),
        }
    }

    #[test]
    fn header_values_are_valid() {
        for (name, value) in SECURITY_HEADERS {
            assert!(HeaderName::from_bytes(name.as_bytes()).is_ok(), "{}", name);
            assert!(HeaderValue::from_str(value).is_ok(), "{}", name);
        }
    }
}
