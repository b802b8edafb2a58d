//! Credential container with automatic memory zeroing.
//!
//! # Security
//! - Username and password live in `Zeroizing` containers
//! - Memory is cleared when the last copy is dropped
//! - `Debug` output never contains the password

use zeroize::Zeroizing;

/// User name reported when a descriptor carries none.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Database credentials attached to a [`DataSource`](crate::DataSource).
///
/// # Example
///
/// ```rust
/// use dbsentinel_core::Credentials;
///
/// let creds = Credentials::new("monitor", Some("secret".to_string()));
/// assert_eq!(creds.username(), "monitor");
/// assert!(creds.has_password());
/// assert!(!format!("{creds:?}").contains("secret"));
/// ```
#[derive(Clone, Default)]
pub struct Credentials {
    username: Option<Zeroizing<String>>,
    password: Option<Zeroizing<String>>,
}

impl Credentials {
    /// Creates credentials for a named user.
    pub fn new(username: impl Into<String>, password: Option<String>) -> Self {
        Self {
            username: Some(Zeroizing::new(username.into())),
            password: password.map(Zeroizing::new),
        }
    }

    /// Credentials without user or password.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// The user name, or `anonymous` when none was configured.
    pub fn username(&self) -> &str {
        self.username
            .as_ref()
            .map_or(ANONYMOUS_USER, |name| name.as_str())
    }

    /// Returns true when an explicit user name was configured.
    pub const fn has_username(&self) -> bool {
        self.username.is_some()
    }

    /// Checks if password is present without exposing it.
    pub const fn has_password(&self) -> bool {
        self.password.is_some()
    }

    /// Exposes the password to a driver.
    pub(crate) fn password(&self) -> Option<&str> {
        self.password.as_ref().map(|p| p.as_str())
    }

    /// Returns a copy with a different user name and the same password.
    #[must_use]
    pub fn with_username(&self, username: impl Into<String>) -> Self {
        Self {
            username: Some(Zeroizing::new(username.into())),
            password: self.password.clone(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username())
            .field("password", &self.password.as_ref().map(|_| "****"))
            .finish()
    }
}
