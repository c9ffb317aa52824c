//! Credential provider (§6): "injected; yields current access key, secret, optional
//! session token."
//!
//! [`IamRoleCredentials`]' refresh-ahead-of-expiry shape is grounded on the teacher's
//! OAuth2 token-refresh module, re-expressed for this crate's synchronous concurrency
//! model: a background `std::thread` sleeping on a [`parking_lot::Condvar`] instead of an
//! async task on a runtime timer.

use crate::error::{Result, StoreError};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use zeroize::Zeroize;

/// A snapshot of credentials usable to sign one request.
#[derive(Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
}

impl Drop for Credentials {
    fn drop(&mut self) {
        self.secret_key.zeroize();
    }
}

/// Yields the credentials the HTTP I/O layer signs requests with.
pub trait CredentialProvider: Send + Sync {
    fn credentials(&self) -> Result<Credentials>;
}

/// Fixed, never-expiring credentials (the common case: a configured access/secret key
/// pair, optionally with a session token for temporary STS credentials).
pub struct StaticCredentials(Credentials);

impl StaticCredentials {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self(Credentials {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            session_token,
        })
    }
}

impl CredentialProvider for StaticCredentials {
    fn credentials(&self) -> Result<Credentials> {
        Ok(self.0.clone())
    }
}

/// Fetches a fresh set of role credentials and the duration they remain valid for. A
/// real implementation would call the instance-metadata service or STS; this trait keeps
/// that HTTP call pluggable instead of fabricating an IMDS client here.
pub trait RoleCredentialSource: Send + Sync {
    fn fetch(&self) -> Result<(Credentials, Duration)>;
}

struct Slot {
    credentials: Option<Credentials>,
    expires_at: Option<Instant>,
}

/// Credentials backed by an IAM role, refreshed ahead of expiry on a dedicated
/// background thread (§4.4: "refreshed ahead of expiry on a dedicated periodic
/// schedule").
pub struct IamRoleCredentials {
    slot: Arc<Mutex<Slot>>,
    ready: Arc<Condvar>,
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

/// Refresh this far ahead of expiry, matching common IMDS/STS client practice.
const REFRESH_SKEW: Duration = Duration::from_secs(60);

impl IamRoleCredentials {
    pub fn start(source: Arc<dyn RoleCredentialSource>) -> Result<Self> {
        let slot = Arc::new(Mutex::new(Slot {
            credentials: None,
            expires_at: None,
        }));
        let ready = Arc::new(Condvar::new());
        let stop = Arc::new(AtomicBool::new(false));

        // Fetch once synchronously so the first caller never blocks on the background
        // thread winning a race.
        let (creds, ttl) = source.fetch()?;
        {
            let mut guard = slot.lock();
            guard.expires_at = Some(Instant::now() + ttl);
            guard.credentials = Some(creds);
        }

        let thread_slot = slot.clone();
        let thread_ready = ready.clone();
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("iam-role-refresh".into())
            .spawn(move || loop {
                let sleep_for = {
                    let guard = thread_slot.lock();
                    match guard.expires_at {
                        Some(expiry) => expiry
                            .saturating_duration_since(Instant::now())
                            .saturating_sub(REFRESH_SKEW),
                        None => Duration::from_secs(1),
                    }
                };
                if thread_stop.load(Ordering::Acquire) {
                    return;
                }
                // Wait either for the refresh deadline or an explicit stop notification.
                let mut guard = thread_slot.lock();
                let result = thread_ready.wait_for(&mut guard, sleep_for);
                drop(guard);
                if thread_stop.load(Ordering::Acquire) {
                    return;
                }
                if result.timed_out() {
                    if let Ok((creds, ttl)) = source.fetch() {
                        let mut guard = thread_slot.lock();
                        guard.expires_at = Some(Instant::now() + ttl);
                        guard.credentials = Some(creds);
                    }
                }
            })
            .map_err(|e| StoreError::io(format!("failed to spawn credential refresh thread: {e}")))?;

        Ok(Self {
            slot,
            ready,
            stop,
            handle: Some(handle),
        })
    }
}

impl CredentialProvider for IamRoleCredentials {
    fn credentials(&self) -> Result<Credentials> {
        self.slot
            .lock()
            .credentials
            .clone()
            .ok_or_else(|| StoreError::auth("no IAM role credentials available yet"))
    }
}

impl Drop for IamRoleCredentials {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.ready.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_credentials_roundtrip() {
        let provider = StaticCredentials::new("AKIA", "secret", Some("token".into()));
        let creds = provider.credentials().unwrap();
        assert_eq!(creds.access_key, "AKIA");
        assert_eq!(creds.session_token.as_deref(), Some("token"));
    }

    struct FixedSource;
    impl RoleCredentialSource for FixedSource {
        fn fetch(&self) -> Result<(Credentials, Duration)> {
            Ok((
                Credentials {
                    access_key: "ASIA".into(),
                    secret_key: "s".into(),
                    session_token: None,
                },
                Duration::from_secs(900),
            ))
        }
    }

    #[test]
    fn iam_role_credentials_available_immediately() {
        let creds = IamRoleCredentials::start(Arc::new(FixedSource)).unwrap();
        assert_eq!(creds.credentials().unwrap().access_key, "ASIA");
    }
}
