pub mod auth;

pub use auth::{AppId, BearerToken, UserAgent, APP_ID_HEADER};
