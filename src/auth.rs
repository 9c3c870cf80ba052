use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::Reservation;
use crate::observability;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Admin,
}

/// The authenticated identity behind a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub requester_id: Ulid,
    pub role: Role,
}

impl Principal {
    pub fn user(requester_id: Ulid) -> Self {
        Self {
            requester_id,
            role: Role::User,
        }
    }

    pub fn admin(requester_id: Ulid) -> Self {
        Self {
            requester_id,
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_admin(&self) -> Result<(), EngineError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(EngineError::Forbidden("admin role required"))
        }
    }

    /// Owners act on their own records; admins act on any.
    pub fn may_act_on(&self, reservation: &Reservation) -> bool {
        self.is_admin() || reservation.requester_id == self.requester_id
    }
}

/// Maps login names to principals. The login name is the requester's ULID;
/// ids listed as admins get the admin role.
#[derive(Debug, Default)]
pub struct AccessPolicy {
    admins: HashSet<Ulid>,
}

impl AccessPolicy {
    pub fn new(admins: impl IntoIterator<Item = Ulid>) -> Self {
        Self {
            admins: admins.into_iter().collect(),
        }
    }

    pub fn principal_for(&self, login: &str) -> Result<Principal, EngineError> {
        let requester_id = Ulid::from_string(login.trim())
            .map_err(|_| EngineError::Forbidden("login name is not a requester id"))?;
        Ok(if self.admins.contains(&requester_id) {
            Principal::admin(requester_id)
        } else {
            Principal::user(requester_id)
        })
    }
}

/// Shared-password login that also rejects names that are not requester ids.
#[derive(Debug)]
pub struct SpotdAuthSource {
    password: String,
    policy: Arc<AccessPolicy>,
}

impl SpotdAuthSource {
    pub fn new(password: String, policy: Arc<AccessPolicy>) -> Self {
        Self { password, policy }
    }
}

#[async_trait]
impl AuthSource for SpotdAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        if let Err(e) = self.policy.principal_for(user) {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                e.to_string(),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admins_come_from_the_list() {
        let admin = Ulid::new();
        let policy = AccessPolicy::new([admin]);

        let p = policy.principal_for(&admin.to_string()).unwrap();
        assert!(p.is_admin());
        assert!(p.require_admin().is_ok());

        let other = Ulid::new();
        let p = policy.principal_for(&other.to_string()).unwrap();
        assert_eq!(p, Principal::user(other));
        assert!(matches!(p.require_admin(), Err(EngineError::Forbidden(_))));
    }

    #[test]
    fn non_ulid_login_is_rejected() {
        let policy = AccessPolicy::default();
        assert!(matches!(policy.principal_for("postgres"), Err(EngineError::Forbidden(_))));
        assert!(policy.principal_for("").is_err());
    }

    #[tokio::test]
    async fn password_is_served_only_for_requester_logins() {
        let source = SpotdAuthSource::new("spotd".into(), Arc::new(AccessPolicy::default()));
        let requester = Ulid::new().to_string();

        let login = LoginInfo::new(Some(requester.as_str()), Some("spots"), "127.0.0.1".into());
        let password = source.get_password(&login).await.unwrap();
        assert_eq!(password.password(), b"spotd");

        let login = LoginInfo::new(Some("postgres"), Some("spots"), "127.0.0.1".into());
        assert!(source.get_password(&login).await.is_err());

        let login = LoginInfo::new(None, Some("spots"), "127.0.0.1".into());
        assert!(source.get_password(&login).await.is_err());
    }

    #[test]
    fn owners_and_admins_may_act() {
        let owner = Ulid::new();
        let reservation = Reservation {
            id: Ulid::new(),
            pool_id: Ulid::new(),
            slot_number: 1,
            claimant_id: Ulid::new(),
            requester_id: owner,
            date: 0,
            created_at: 0,
        };
        assert!(Principal::user(owner).may_act_on(&reservation));
        assert!(!Principal::user(Ulid::new()).may_act_on(&reservation));
        assert!(Principal::admin(Ulid::new()).may_act_on(&reservation));
    }
}
