use crate::error::{SchedulerError, SchedulerResult};
use crate::models::UserId;

/// Resolves the user on whose behalf an operation runs.
pub trait IdentityResolver {
    fn resolve(&self) -> SchedulerResult<UserId>;
}

/// An identity fixed up front, e.g. from a `--user` flag or in tests.
pub struct StaticIdentity(pub UserId);

impl IdentityResolver for StaticIdentity {
    fn resolve(&self) -> SchedulerResult<UserId> {
        validate_user_id(&self.0)
    }
}

/// Reads the identity from an environment variable. A missing variable is an
/// error rather than a silent switch to some default account.
pub struct EnvIdentity {
    pub var: &'static str,
}

impl IdentityResolver for EnvIdentity {
    fn resolve(&self) -> SchedulerResult<UserId> {
        let value = std::env::var(self.var).map_err(|_| {
            SchedulerError::validation(format!(
                "no user given; pass --user or set {}",
                self.var
            ))
        })?;
        validate_user_id(&value)
    }
}

fn validate_user_id(raw: &str) -> SchedulerResult<UserId> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SchedulerError::validation("user id must not be empty"));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_identity_trims() {
        let id = StaticIdentity("  alice ".to_string()).resolve().unwrap();
        assert_eq!(id, "alice");
    }

    #[test]
    fn static_identity_rejects_blank() {
        assert!(StaticIdentity("   ".to_string()).resolve().is_err());
    }

    #[test]
    fn env_identity_missing_var_is_error() {
        let resolver = EnvIdentity {
            var: "CADENCE_TEST_IDENTITY_THAT_IS_NEVER_SET",
        };
        let err = resolver.resolve().unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
    }
}
