//! Selector syntax for backends and challenge handlers.
//!
//! Both sides of the protocol are configured from strings of the form
//! `name[:key=value[,key=value,...]]`, e.g.:
//!
//! ```text
//! --auth=file:filename=/path/to/secret
//! --auth=multifile:filename=/path/to/table
//! --challenge-handlers=file:filename=/path/to/secret
//! ```

use std::fs;
use std::path::PathBuf;

use tracing::warn;

use super::file::{FileAuth, MultiFileAuth};
use super::{AuthBackend, AuthError};

/// Splits `name[:key=value,...]` into the name and its options.
fn split_selector(selector: &str) -> Result<(&str, Vec<(&str, &str)>), AuthError> {
    let (name, rest) = match selector.split_once(':') {
        Some((name, rest)) => (name, rest),
        None => return Ok((selector, Vec::new())),
    };
    let mut options = Vec::new();
    for part in rest.split(',') {
        if part.is_empty() {
            continue;
        }
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| AuthError::MalformedOption(part.to_string()))?;
        options.push((key, value));
    }
    Ok((name, options))
}

/// Extracts the `filename` option, warning about anything else.
fn filename_option(name: &str, options: &[(&str, &str)]) -> Option<PathBuf> {
    let mut filename = None;
    for (key, value) in options {
        match *key {
            "filename" => filename = Some(PathBuf::from(value)),
            other => warn!("{name}: ignoring unknown selector option {other:?}"),
        }
    }
    filename
}

/// Parses a backend selector into a configured [`AuthBackend`].
///
/// `file` and `multifile` may be selected without a `filename`; they then
/// behave as unconfigured (every attempt ends in `PASSWORD_REQUIRED`).
///
/// # Errors
///
/// Returns [`AuthError::UnknownBackend`] for unknown names and
/// [`AuthError::MalformedOption`] for options not of the form `key=value`.
pub fn parse_backend(selector: &str) -> Result<AuthBackend, AuthError> {
    let (name, options) = split_selector(selector)?;
    match name {
        "none" => Ok(AuthBackend::None),
        "allow" => Ok(AuthBackend::Allow),
        "reject" => Ok(AuthBackend::Reject),
        "fail" => Ok(AuthBackend::Fail),
        "file" => Ok(AuthBackend::File(FileAuth::new(filename_option(
            name, &options,
        )))),
        "multifile" => Ok(AuthBackend::MultiFile(MultiFileAuth::new(
            filename_option(name, &options),
        ))),
        other => Err(AuthError::UnknownBackend(other.to_string())),
    }
}

/// Client-side source of the secret used to answer a challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeHandler {
    /// Reads the literal file contents as the shared secret.
    File { path: PathBuf },
}

impl ChallengeHandler {
    /// Produces the secret, or `None` when it cannot be obtained (the client
    /// then answers the challenge with no response).
    pub fn secret(&self) -> Option<String> {
        match self {
            ChallengeHandler::File { path } => match fs::read_to_string(path) {
                Ok(contents) => Some(contents.trim_end_matches(['\r', '\n']).to_string()),
                Err(e) => {
                    warn!("cannot read challenge secret {}: {e}", path.display());
                    None
                }
            },
        }
    }
}

/// Parses a challenge-handler selector, e.g. `file:filename=/path`.
///
/// # Errors
///
/// Returns [`AuthError::UnknownHandler`] for unknown names and
/// [`AuthError::MissingOption`] when `file` lacks its `filename`.
pub fn parse_challenge_handler(selector: &str) -> Result<ChallengeHandler, AuthError> {
    let (name, options) = split_selector(selector)?;
    match name {
        "file" => {
            let path = filename_option(name, &options).ok_or(AuthError::MissingOption {
                handler: "file",
                option: "filename",
            })?;
            Ok(ChallengeHandler::File { path })
        }
        other => Err(AuthError::UnknownHandler(other.to_string())),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_bare_backend_names_parse() {
        assert_eq!(parse_backend("none").unwrap(), AuthBackend::None);
        assert_eq!(parse_backend("allow").unwrap(), AuthBackend::Allow);
        assert_eq!(parse_backend("reject").unwrap(), AuthBackend::Reject);
        assert_eq!(parse_backend("fail").unwrap(), AuthBackend::Fail);
    }

    #[test]
    fn test_file_selector_with_filename() {
        let backend = parse_backend("file:filename=/tmp/secret").unwrap();
        assert_eq!(
            backend,
            AuthBackend::File(FileAuth::new(Some(PathBuf::from("/tmp/secret"))))
        );
    }

    #[test]
    fn test_file_selector_without_filename_is_unconfigured() {
        assert_eq!(
            parse_backend("file").unwrap(),
            AuthBackend::File(FileAuth::new(None))
        );
    }

    #[test]
    fn test_multifile_selector_with_filename() {
        let backend = parse_backend("multifile:filename=/tmp/table").unwrap();
        assert_eq!(
            backend,
            AuthBackend::MultiFile(MultiFileAuth::new(Some(PathBuf::from("/tmp/table"))))
        );
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        assert_eq!(
            parse_backend("ldap"),
            Err(AuthError::UnknownBackend("ldap".to_string()))
        );
    }

    #[test]
    fn test_malformed_option_is_rejected() {
        assert_eq!(
            parse_backend("file:filename"),
            Err(AuthError::MalformedOption("filename".to_string()))
        );
    }

    #[test]
    fn test_unknown_options_are_tolerated() {
        // Forward compatibility: unknown keys warn but do not fail.
        let backend = parse_backend("file:filename=/tmp/s,mode=strict").unwrap();
        assert_eq!(
            backend,
            AuthBackend::File(FileAuth::new(Some(PathBuf::from("/tmp/s"))))
        );
    }

    #[test]
    fn test_challenge_handler_reads_file_secret() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "hunter2\n").unwrap();
        let handler =
            parse_challenge_handler(&format!("file:filename={}", f.path().display())).unwrap();
        assert_eq!(handler.secret().unwrap(), "hunter2");
    }

    #[test]
    fn test_challenge_handler_requires_filename() {
        assert_eq!(
            parse_challenge_handler("file"),
            Err(AuthError::MissingOption {
                handler: "file",
                option: "filename"
            })
        );
    }

    #[test]
    fn test_challenge_handler_unknown_name() {
        assert_eq!(
            parse_challenge_handler("prompt"),
            Err(AuthError::UnknownHandler("prompt".to_string()))
        );
    }

    #[test]
    fn test_challenge_handler_missing_file_yields_no_secret() {
        let handler = ChallengeHandler::File {
            path: PathBuf::from("/nonexistent/xgate-secret"),
        };
        assert_eq!(handler.secret(), None);
    }
}
