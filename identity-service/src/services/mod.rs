//! Services layer of the identity service.
//!
//! Token codec, key loading, strategy matching, challenges, tenant claims,
//! the user controller, notification transports and storage backends.

pub mod challenge;
pub mod context;
pub mod controller;
pub mod credentials;
pub mod email;
pub mod error;
pub mod jwt;
pub mod keys;
pub mod memory;
pub mod messages;
pub mod redis;
pub mod sms;
pub mod storage;
pub mod strategy;
pub mod tenant;

pub use challenge::{ChallengeEngine, ChallengeRequest, ChallengeVerification, IssuedChallenge};
pub use context::RequestContext;
pub use controller::{
    ControllerSettings, InvitationRequest, NewUserRequest, Notifiers, ResetEmailData, Stores,
    UserController,
};
pub use credentials::Password;
pub use email::{EmailProvider, EmailTemplate, MockEmailService, SmtpConfig, SmtpEmailService};
pub use error::{ErrorKind, ServiceError};
pub use jwt::{Claims, Token, TokenConfig, TokenService};
pub use keys::{FileKeyStorage, KeyPair, KeyStorage, SigningAlgorithm, StaticKeyStorage};
pub use memory::{InMemoryStore, SeedData};
pub use messages::{BuiltinCatalog, MessageCatalog};
pub use redis::RedisTokenStorage;
pub use sms::{HttpSmsProvider, MockSmsProvider, SmsGatewayConfig, SmsProvider};
pub use storage::{AppStorage, InviteStorage, TokenStorage, UserAuthStorage, UserStorage};
