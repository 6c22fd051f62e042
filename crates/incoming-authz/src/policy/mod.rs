//! Incoming-permission policy: the validated model and its loader.

pub mod loader;
pub mod model;

pub use loader::{compile, load_policy, ConfigValidationError, PolicyLoadError, Violation};
pub use model::{
    ClientRef, EndpointRule, IncomingPermissions, OAuthPolicy, OAuthRequirement, PathMatcher,
    UnlistedPolicy,
};
