pub mod app;
pub mod challenge;
pub mod invitation;
pub mod tenant;
pub mod token;
pub mod user;

pub use app::{
    AppData, AuthStrategy, AuthStrategyType, ChallengeType, CustomSmsMessages, FederatedStrategy,
    FirstFactorInternalStrategy, Identity, LoginAppSettings, TokenLifetimes, Transport,
};
pub use challenge::{ChallengeState, SolveContext, UserAuthChallenge, MAX_VERIFY_ATTEMPTS};
pub use invitation::{Invite, InviteQuery};
pub use tenant::{merge_memberships, GroupRoles, TenantMembership, TenantMemberships};
pub use token::{AuthResponse, TokenStorageEntity, TokenType};
pub use user::{NewUser, PendingUser, ResolvedUser, User, UserData, UserDataField};
