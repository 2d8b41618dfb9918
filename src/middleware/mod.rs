pub mod gateway;
pub mod idp;
pub mod rate;

pub use gateway::{
    create_delete_cookie, create_secure_cookie, gateway_middleware, AuthSession, ClientIp, Gateway, GatewayConfig,
    RouteClass,
};
pub use idp::{require_identity_provider, IdpVerifier};
pub use rate::RateLimiter;
