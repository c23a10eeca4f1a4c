//! Remote source URLs: `[ssh://]user@host[:port]:/absolute/path`.
//!
//! Every component is validated before any connection is attempted. Errors
//! name the component that failed and never echo the rejected text.

use crate::error::{SourceError, UrlComponent};
use std::fmt;

const SCHEME: &str = "ssh://";
const DEFAULT_PORT: u16 = 22;

const MAX_USER_LENGTH: usize = 32;
const MAX_HOST_LENGTH: usize = 253;
const MAX_PATH_LENGTH: usize = 4096;
const MAX_URL_LENGTH: usize = SCHEME.len() + MAX_USER_LENGTH + MAX_HOST_LENGTH + MAX_PATH_LENGTH + 8;

/// Characters a remote shell would interpret.
const SHELL_METACHARACTERS: &[char] = &[
    '"', '\'', '`', '$', '|', '&', ';', '<', '>', '(', ')', '{', '}', '\\', '*', '?', '!', '[',
    ']', '~', '#',
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshUrl {
    user: String,
    host: String,
    port: u16,
    path: String,
}

impl SshUrl {
    pub fn parse(input: &str) -> Result<Self, SourceError> {
        if input.len() > MAX_URL_LENGTH {
            return Err(invalid(UrlComponent::Format, "exceeds maximum length"));
        }

        let rest = input.strip_prefix(SCHEME).unwrap_or(input);

        let (user, rest) = rest
            .split_once('@')
            .ok_or_else(|| invalid(UrlComponent::Format, "must have the form user@host:/path"))?;
        let (host, rest) = rest
            .split_once(':')
            .ok_or_else(|| invalid(UrlComponent::Format, "must have the form user@host:/path"))?;

        let (port, path) = if rest.starts_with('/') {
            (DEFAULT_PORT, rest)
        } else {
            match rest.split_once(':') {
                Some((port, path)) if !port.contains('/') => (parse_port(port)?, path),
                _ => return Err(invalid(UrlComponent::Path, "must be absolute")),
            }
        };

        validate_user(user)?;
        validate_host(host)?;
        validate_path(path)?;

        Ok(Self {
            user: user.to_string(),
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Last path segment, the only part of the path that appears in errors.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

impl fmt::Display for SshUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == DEFAULT_PORT {
            write!(f, "{}@{}:{}", self.user, self.host, self.path)
        } else {
            write!(f, "{}@{}:{}:{}", self.user, self.host, self.port, self.path)
        }
    }
}

/// Whether `identifier` should be treated as a remote URL rather than a
/// local path. Only the shape is checked; [`SshUrl::parse`] validates.
pub fn is_ssh_url(identifier: &str) -> bool {
    if identifier.starts_with(SCHEME) {
        return true;
    }

    let Some((user, rest)) = identifier.split_once('@') else {
        return false;
    };
    if user.is_empty()
        || user.contains(['/', '\\', ':'])
        || user.chars().any(char::is_whitespace)
    {
        return false;
    }

    match rest.split_once(':') {
        Some((host, remainder)) => {
            !host.is_empty() && !host.contains('/') && !remainder.is_empty()
        }
        None => false,
    }
}

fn invalid(component: UrlComponent, reason: &'static str) -> SourceError {
    SourceError::InvalidUrl { component, reason }
}

fn parse_port(text: &str) -> Result<u16, SourceError> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(UrlComponent::Port, "must be a number"));
    }
    match text.parse::<u32>() {
        Ok(port @ 1..=65535) => Ok(port as u16),
        _ => Err(invalid(UrlComponent::Port, "must be between 1 and 65535")),
    }
}

fn validate_user(user: &str) -> Result<(), SourceError> {
    if user.is_empty() || user.len() > MAX_USER_LENGTH {
        return Err(invalid(UrlComponent::User, "must be 1 to 32 characters"));
    }
    if user.starts_with('-') {
        return Err(invalid(UrlComponent::User, "must not start with '-'"));
    }
    if !user
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(invalid(UrlComponent::User, "contains invalid characters"));
    }
    Ok(())
}

fn validate_host(host: &str) -> Result<(), SourceError> {
    if host.is_empty() || host.len() > MAX_HOST_LENGTH {
        return Err(invalid(UrlComponent::Host, "must be 1 to 253 characters"));
    }
    if !host.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(invalid(UrlComponent::Host, "must start with a letter or digit"));
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'))
    {
        return Err(invalid(UrlComponent::Host, "contains invalid characters"));
    }
    Ok(())
}

fn validate_path(path: &str) -> Result<(), SourceError> {
    if !path.starts_with('/') {
        return Err(invalid(UrlComponent::Path, "must be absolute"));
    }
    if path.len() > MAX_PATH_LENGTH {
        return Err(invalid(UrlComponent::Path, "exceeds maximum length"));
    }
    if path.contains('\0') {
        return Err(invalid(UrlComponent::Path, "contains a NUL byte"));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(invalid(UrlComponent::Path, "contains a traversal sequence"));
    }
    if path.contains(SHELL_METACHARACTERS) {
        return Err(invalid(UrlComponent::Path, "contains shell metacharacters"));
    }
    if path.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid(UrlComponent::Path, "contains whitespace or control characters"));
    }
    Ok(())
}
