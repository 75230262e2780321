//! Caller authentication.
//!
//! Callers present `Authorization: Bearer <key>`. Keys are matched against the configured caller
//! accounts using constant-time comparison, and the matching account becomes the
//! [`CallerIdentity`] that the access gate and payload adapter see.
use crate::AppState;
use crate::client::HttpClient;
use crate::errors::GatewayError;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use bon::Builder;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::debug;

/// A wrapper around String that uses constant-time equality comparison
/// to prevent timing attacks on API key validation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConstantTimeString(String);

impl From<String> for ConstantTimeString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConstantTimeString {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl PartialEq for ConstantTimeString {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl Eq for ConstantTimeString {}

impl Hash for ConstantTimeString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
    Pending,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
            Role::Pending => "pending",
        }
    }
}

/// An already-authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
pub struct CallerIdentity {
    #[builder(into)]
    pub id: String,
    #[builder(into)]
    pub name: String,
    #[builder(into)]
    pub email: String,
    pub role: Role,
    /// Groups the caller belongs to, matched against model access-control lists.
    #[serde(default)]
    #[builder(default)]
    pub group_ids: Vec<String>,
}

impl CallerIdentity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// A caller as it appears in the gateway file: an identity plus its bearer key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallerAccount {
    pub api_key: ConstantTimeString,
    #[serde(flatten)]
    pub identity: CallerIdentity,
}

/// The live set of callers, keyed by bearer key.
#[derive(Debug, Clone, Default)]
pub struct Callers {
    by_key: Arc<DashMap<ConstantTimeString, CallerIdentity>>,
}

impl Callers {
    pub fn from_accounts(accounts: Vec<CallerAccount>) -> Self {
        let callers = Self::default();
        callers.replace(accounts);
        callers
    }

    /// Looks up the caller owning `token`.
    pub fn authenticate(&self, token: &str) -> Option<CallerIdentity> {
        self.by_key
            .get(&ConstantTimeString::from(token))
            .map(|entry| entry.value().clone())
    }

    /// Replaces the caller set without a window in which valid keys are missing.
    pub fn replace(&self, accounts: Vec<CallerAccount>) {
        let incoming: Vec<(ConstantTimeString, CallerIdentity)> = accounts
            .into_iter()
            .map(|account| (account.api_key, account.identity))
            .collect();

        self.by_key
            .retain(|key, _| incoming.iter().any(|(incoming_key, _)| incoming_key == key));
        for (key, identity) in incoming {
            self.by_key.insert(key, identity);
        }
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Any caller whose account is active (admin or user).
#[derive(Debug, Clone)]
pub struct VerifiedUser(pub CallerIdentity);

/// A caller with the admin role.
#[derive(Debug, Clone)]
pub struct AdminUser(pub CallerIdentity);

impl<T> FromRequestParts<AppState<T>> for VerifiedUser
where
    T: HttpClient + Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState<T>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(GatewayError::Unauthorized)?;
        let caller = state
            .callers
            .authenticate(token)
            .ok_or(GatewayError::Unauthorized)?;

        match caller.role {
            Role::Admin | Role::User => Ok(VerifiedUser(caller)),
            Role::Pending => {
                debug!("Rejecting pending caller {}", caller.id);
                Err(GatewayError::Unauthorized)
            }
        }
    }
}

impl<T> FromRequestParts<AppState<T>> for AdminUser
where
    T: HttpClient + Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState<T>,
    ) -> Result<Self, Self::Rejection> {
        let VerifiedUser(caller) = VerifiedUser::from_request_parts(parts, state).await?;
        if caller.is_admin() {
            Ok(AdminUser(caller))
        } else {
            debug!("Caller {} is not an admin", caller.id);
            Err(GatewayError::Forbidden)
        }
    }
}
