#![doc = include_str!("../README.md")]

pub mod config;
pub mod endpoints;
pub mod password;
pub mod repository;
pub mod service;
pub mod token;

pub use config::AuthConfig;
pub use endpoints::{AccountPolicy, AuthEndpoints};
pub use repository::{Account, AccountRepository, MemoryRepository, RateLimitDecision};
pub use service::AuthService;
pub use token::{Claims, TokenAuthority, TokenError};
