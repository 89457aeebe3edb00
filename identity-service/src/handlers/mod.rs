//! HTTP handlers for the identity service.

pub mod auth;
pub mod challenge;
pub mod health;
pub mod invitation;
pub mod management;
pub mod well_known;
