//! Credential resolution for inbound requests.

use std::sync::Arc;

use dgfacade_config::ConfigStore;
use dgfacade_core::{GatewayError, GatewayResult, Request};
use tracing::{debug, warn};

/// Resolves API keys to user identities.
///
/// Request types listed as public in the gateway settings bypass
/// authentication and run anonymously.
pub struct AuthService {
    store: Arc<ConfigStore>,
}

impl AuthService {
    /// Create a service over the credential stores.
    #[must_use]
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    /// Whether a request type bypasses authentication.
    #[must_use]
    pub fn is_public(&self, request_type: &str) -> bool {
        self.store
            .settings()
            .auth
            .public_request_types
            .contains(request_type)
    }

    /// Authenticate a request in place.
    ///
    /// A valid credential derives `user_id`; any identity supplied on the
    /// wire is discarded. Public request types pass through anonymously.
    ///
    /// # Errors
    ///
    /// [`GatewayError::AuthFailed`] when the credential is missing or
    /// invalid and the request type is not public.
    pub fn authenticate(&self, request: &mut Request) -> GatewayResult<()> {
        // Identity only ever comes from the credential.
        request.user_id = None;

        match request.api_key.as_deref() {
            Some(api_key) => match self.store.credentials().resolve_key(api_key) {
                Some(user_id) => {
                    debug!(user_id = %user_id, request_type = %request.request_type, "authenticated");
                    request.user_id = Some(user_id);
                    Ok(())
                },
                None => {
                    warn!(request_type = %request.request_type, "invalid api key");
                    Err(GatewayError::AuthFailed("invalid api key".to_owned()))
                },
            },
            None if self.is_public(&request.request_type) => Ok(()),
            None => Err(GatewayError::AuthFailed(
                "missing api key".to_owned(),
            )),
        }
    }
}

impl std::fmt::Debug for AuthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthService").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Arc<ConfigStore> {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("gateway.json"),
            r#"{"auth": {"public_request_types": ["PING"]}}"#,
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("users.json"),
            r#"{"alice": {"enabled": true}}"#,
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("apikeys.json"),
            r#"{"dgf-alice": {"user": "alice"}}"#,
        )
        .unwrap();
        let store = Arc::new(ConfigStore::open(tmp.path()).unwrap());
        std::mem::forget(tmp);
        store
    }

    #[test]
    fn valid_key_derives_user() {
        let auth = AuthService::new(store());
        let mut request = Request::new("ECHO");
        request.api_key = Some("dgf-alice".to_owned());
        // Wire-supplied identity is discarded.
        request.user_id = Some("mallory".to_owned());

        auth.authenticate(&mut request).unwrap();
        assert_eq!(request.user_id.as_deref(), Some("alice"));
    }

    #[test]
    fn invalid_key_fails() {
        let auth = AuthService::new(store());
        let mut request = Request::new("ECHO");
        request.api_key = Some("dgf-nope".to_owned());
        let err = auth.authenticate(&mut request).unwrap_err();
        assert!(matches!(err, GatewayError::AuthFailed(_)));
    }

    #[test]
    fn missing_key_fails_unless_public() {
        let auth = AuthService::new(store());

        let mut request = Request::new("ECHO");
        assert!(auth.authenticate(&mut request).is_err());

        let mut ping = Request::new("PING");
        auth.authenticate(&mut ping).unwrap();
        assert!(ping.user_id.is_none());
    }
}
