//! Scriptable collaborators for exercising the engine

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    provider::{
        CredentialRefresher, CredentialValidator, ProviderError, RefreshedCredential, TokenClaims,
    },
    AccessToken, AccessTokenRef, RefreshToken, RefreshTokenRef,
};

/// What the refresher does on its next call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Step {
    Succeed,
    SucceedRotating,
    Revoke,
    Reject,
    Unavailable,
    Panic,
}

#[derive(Debug)]
pub(crate) struct ScriptedRefresher {
    delay: Duration,
    expires_in: Duration,
    steps: Mutex<VecDeque<Step>>,
    otherwise: Step,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedRefresher {
    pub(crate) fn succeeding(delay: Duration) -> Self {
        Self::new(delay, Step::Succeed)
    }

    pub(crate) fn new(delay: Duration, otherwise: Step) -> Self {
        Self {
            delay,
            expires_in: Duration::from_secs(3600),
            steps: Mutex::new(VecDeque::new()),
            otherwise,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn then(self, step: Step) -> Self {
        self.steps.lock().push_back(step);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct Counted<'a>(&'a AtomicUsize);

impl Drop for Counted<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CredentialRefresher for ScriptedRefresher {
    async fn refresh(
        &self,
        refresh_token: &RefreshTokenRef,
    ) -> Result<RefreshedCredential, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        let _counted = Counted(&self.in_flight);

        let step = self.steps.lock().pop_front().unwrap_or(self.otherwise);

        tokio::time::sleep(self.delay).await;

        match step {
            Step::Succeed | Step::SucceedRotating => Ok(RefreshedCredential {
                access_token: AccessToken::new(format!("refreshed-{}", call)),
                refresh_token: (step == Step::SucceedRotating)
                    .then(|| RefreshToken::new(format!("{}-rotated", refresh_token.as_str()))),
                expires_in: self.expires_in,
            }),
            Step::Revoke => Err(ProviderError::SessionRevoked("grant revoked".into())),
            Step::Reject => Err(ProviderError::TokenRejected("refresh token expired".into())),
            Step::Unavailable => Err(ProviderError::unavailable("connection reset")),
            Step::Panic => panic!("identity provider client panicked"),
        }
    }
}

/// Returns the same claims for every token, or rejects every token
#[derive(Debug, Default)]
pub(crate) struct FixedClaimsValidator {
    claims: TokenClaims,
    reject: bool,
}

impl FixedClaimsValidator {
    pub(crate) fn returning(claims: TokenClaims) -> Self {
        Self {
            claims,
            reject: false,
        }
    }

    pub(crate) fn rejecting() -> Self {
        Self {
            claims: TokenClaims::default(),
            reject: true,
        }
    }
}

#[async_trait]
impl CredentialValidator for FixedClaimsValidator {
    async fn validate(&self, _: &AccessTokenRef) -> Result<TokenClaims, ProviderError> {
        if self.reject {
            Err(ProviderError::TokenRejected("signature mismatch".into()))
        } else {
            Ok(self.claims.clone())
        }
    }
}
