//! Identity service constants
//!
//! The identity service trades a session cookie (the refresh credential) for a
//! bearer access token. These values identify the public endpoint and cookie
//! name; the secrets themselves live in the worker store.

/// Session endpoint that returns the access token for a session cookie.
pub const SESSION_ENDPOINT: &str = "https://labs.google/fx/api/auth/session";

/// Cookie carrying the refresh credential.
pub const SESSION_COOKIE: &str = "__Secure-next-auth.session-token";

/// Browser-like User-Agent; the session endpoint rejects bare clients.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// File name prefix for cached browser sessions inside the session directory.
pub const SESSION_FILE_PREFIX: &str = "auth_";
