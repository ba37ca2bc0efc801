pub mod claims;
pub mod jwks;
pub mod records;
pub mod session;

pub use claims::{AccessClaims, BillingAddress, IdentityClaims};
pub use jwks::JwksCache;
pub use records::{CachedAccessToken, FreshTokens, RefreshTokenRecord};
pub use session::{HostSession, RequestSession};
