//! Authentication state held by the API client.

use chrono::{DateTime, Utc};

/// The access/refresh token pair and cached login state.
///
/// Mutated only from inside [`crate::rest_api::Client`], under its own lock.
#[derive(Clone, Debug, Default)]
pub struct Session {
    /// The current bearer access token, if logged in.
    pub access_token: Option<String>,
    /// The current refresh token, if logged in.
    pub refresh_token: Option<String>,
    /// Whether the session believes it is logged in.
    pub logged_in: bool,
    /// When the login state was last confirmed against the server, as a
    /// wall-clock timestamp (so it can be displayed or persisted, unlike a
    /// monotonic [`std::time::Instant`]).
    pub last_auth_check: Option<DateTime<Utc>>,
}

impl Session {
    /// Record a fresh token pair from a successful login or refresh.
    pub fn set_tokens(&mut self, access_token: String, refresh_token: String) {
        self.access_token = Some(access_token);
        self.refresh_token = Some(refresh_token);
        self.logged_in = true;
    }

    /// Clear all tokens, e.g. after a failed refresh.
    ///
    /// Per the open question in spec §9(b), the source system leaves tokens
    /// in place when a refresh fails because the refresh token itself has
    /// expired (`return False` without clearing state). We deliberately do
    /// *not* mirror that: clearing on refresh failure avoids the worker
    /// spinning on a stale token that can never succeed. See DESIGN.md.
    pub fn clear_tokens(&mut self) {
        self.access_token = None;
        self.refresh_token = None;
        self.logged_in = false;
    }

    /// Record that we just confirmed (or re-confirmed) our login state.
    pub fn record_auth_check(&mut self, now: DateTime<Utc>) {
        self.last_auth_check = Some(now);
    }
}
