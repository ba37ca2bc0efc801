//! Service layer: identity provider client, token persistence, account
//! resolution and the sign-in orchestrator.

pub mod accounts;
pub mod cache;
pub mod provider;
pub mod sign_in;
pub mod token_store;

pub use accounts::{Account, AccountId, AccountResolver, AccountStore, InMemoryAccountStore};
pub use cache::RedisAccessCache;
pub use provider::KlarnaClient;
pub use sign_in::{SignInEvent, SignInOrchestrator, SignInOutcome, SignInResult, SignInSource};
pub use token_store::{
    AccessCache, AttributeStore, InMemoryAccessCache, InMemoryAttributeStore, TokenStore,
};
