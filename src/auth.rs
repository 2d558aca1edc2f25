// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Caller Identity Lookup
//!
//! The consumer establishes a caller identity from the `user_name` header
//! before dispatching a message. The actual user store is an external
//! collaborator behind the [`UserLookup`] trait; a lookup miss means "no
//! authenticated caller", never an error.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// A resolved caller identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
}

/// External user store, matched against a configured lookup column.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserLookup: Send + Sync {
    async fn find_by(&self, column: &str, value: &str) -> Option<Identity>;
}

/// Lookup that never resolves anyone; the default when no store is wired in.
pub struct NoUserLookup;

#[async_trait]
impl UserLookup for NoUserLookup {
    async fn find_by(&self, _column: &str, _value: &str) -> Option<Identity> {
        None
    }
}

/// Resolves the caller identity for the duration of message handling.
pub struct Authenticator {
    lookup: Arc<dyn UserLookup>,
    column: String,
}

impl Authenticator {
    pub fn new(lookup: Arc<dyn UserLookup>, column: &str) -> Authenticator {
        Authenticator {
            lookup,
            column: column.to_owned(),
        }
    }

    /// Resolves the identity named by the `user_name` header. Empty names and
    /// lookup misses resolve to no identity, silently.
    pub async fn authenticate(&self, user_name: &str) -> Option<Identity> {
        if user_name.is_empty() {
            return None;
        }

        let identity = self.lookup.find_by(&self.column, user_name).await;
        if identity.is_none() {
            debug!(user_name, "no user matched, handling unauthenticated");
        }

        identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookup_miss_is_treated_as_unauthenticated() {
        let mut lookup = MockUserLookup::new();
        lookup.expect_find_by().returning(|_, _| None);

        let auth = Authenticator::new(Arc::new(lookup), "name");

        assert_eq!(auth.authenticate("ghost").await, None);
    }

    #[tokio::test]
    async fn empty_user_name_skips_the_lookup_entirely() {
        let mut lookup = MockUserLookup::new();
        lookup.expect_find_by().never();

        let auth = Authenticator::new(Arc::new(lookup), "name");

        assert_eq!(auth.authenticate("").await, None);
    }

    #[tokio::test]
    async fn hit_resolves_the_identity_via_the_configured_column() {
        let mut lookup = MockUserLookup::new();
        lookup
            .expect_find_by()
            .withf(|column, value| column == "email" && value == "alice")
            .returning(|_, value| {
                Some(Identity {
                    name: value.to_owned(),
                })
            });

        let auth = Authenticator::new(Arc::new(lookup), "email");

        assert_eq!(
            auth.authenticate("alice").await,
            Some(Identity {
                name: "alice".to_owned()
            })
        );
    }
}
