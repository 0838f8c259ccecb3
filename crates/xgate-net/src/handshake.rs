//! The wire authentication handshake.
//!
//! Runs over any confirmed [`Connection`], immediately after transport
//! detection.  Line-oriented UTF-8, every line `\n`-terminated:
//!
//! ```text
//! server → client   challenge <digest-mode> <salt-hex>
//! client → server   response <digest-hex>[ <username>]
//!                   noresponse
//! server → client   ok
//!                   denied <RESULT_CODE>
//! ```
//!
//! The `fail` backend never sends a challenge: it closes the socket, which
//! the peer observes as `CONNECTION_FAILED`.  Exactly one attempt runs per
//! connection; the outcome is never silently retried.

use std::time::Duration;

use tracing::{debug, warn};

use xgate_core::{
    AuthBackend, AuthResponse, Challenge, ChallengeHandler, Connection, DigestMode, ResultCode,
};

/// Longest accepted handshake line, including the terminator.
const MAX_LINE: usize = 4096;

/// Runs the server side of the handshake on a freshly admitted connection.
///
/// On `OK` the connection is left open for the session layer; on any other
/// outcome it is closed here.  Transport failures, timeouts, and malformed
/// lines all resolve to `CONNECTION_FAILED`.
pub async fn authenticate(
    conn: &mut dyn Connection,
    backend: &AuthBackend,
    display: &str,
    timeout: Duration,
) -> ResultCode {
    let code = run_authenticate(conn, backend, display, timeout).await;
    if code != ResultCode::Ok {
        conn.close().await;
    }
    code
}

async fn run_authenticate(
    conn: &mut dyn Connection,
    backend: &AuthBackend,
    display: &str,
    timeout: Duration,
) -> ResultCode {
    if !backend.issues_challenge() {
        debug!(backend = backend.name(), "refusing connection before challenge");
        return ResultCode::ConnectionFailed;
    }

    let challenge = Challenge::new(DigestMode::default());
    let line = format!(
        "challenge {} {}\n",
        challenge.digest,
        hex::encode(&challenge.salt)
    );
    if let Err(e) = conn.write(line.as_bytes()).await {
        debug!("cannot send challenge: {e}");
        return ResultCode::ConnectionFailed;
    }

    let line = match read_line(conn, timeout).await {
        Ok(Some(line)) => line,
        Ok(None) => {
            debug!("peer closed before answering the challenge");
            return ResultCode::ConnectionFailed;
        }
        Err(e) => {
            debug!("cannot read challenge response: {e}");
            return ResultCode::ConnectionFailed;
        }
    };

    let response = match parse_response_line(&line) {
        Ok(response) => response,
        Err(()) => {
            warn!(peer = %conn.endpoint(), "malformed handshake line");
            return ResultCode::ConnectionFailed;
        }
    };

    let code = ResultCode::from(backend.verify(&challenge, response.as_ref(), display));
    let reply = match code {
        ResultCode::Ok => "ok\n".to_string(),
        other => format!("denied {other}\n"),
    };
    if let Err(e) = conn.write(reply.as_bytes()).await {
        debug!("cannot send handshake verdict: {e}");
        return ResultCode::ConnectionFailed;
    }
    code
}

/// Runs the client side of the handshake.
///
/// `handler` supplies the secret; without one (or when the handler cannot
/// produce a secret) the challenge is answered with `noresponse`.  Any
/// transport failure resolves to `CONNECTION_FAILED` — including the server
/// closing the socket before the challenge, which is how the `fail` backend
/// presents itself.
pub async fn respond(
    conn: &mut dyn Connection,
    handler: Option<&ChallengeHandler>,
    username: Option<&str>,
    timeout: Duration,
) -> ResultCode {
    let line = match read_line(conn, timeout).await {
        Ok(Some(line)) => line,
        Ok(None) => {
            debug!("server closed before sending a challenge");
            return ResultCode::ConnectionFailed;
        }
        Err(e) => {
            debug!("cannot read challenge: {e}");
            return ResultCode::ConnectionFailed;
        }
    };

    let Some((digest, salt)) = parse_challenge_line(&line) else {
        debug!("malformed challenge line");
        return ResultCode::ConnectionFailed;
    };

    let reply = match handler.and_then(|h| h.secret()) {
        Some(secret) => {
            let answer = hex::encode(digest.respond(secret.as_bytes(), &salt));
            match username {
                Some(user) => format!("response {answer} {user}\n"),
                None => format!("response {answer}\n"),
            }
        }
        None => "noresponse\n".to_string(),
    };
    if conn.write(reply.as_bytes()).await.is_err() {
        return ResultCode::ConnectionFailed;
    }

    match read_line(conn, timeout).await {
        Ok(Some(line)) => parse_verdict_line(&line).unwrap_or(ResultCode::ConnectionFailed),
        Ok(None) | Err(_) => ResultCode::ConnectionFailed,
    }
}

fn parse_challenge_line(line: &str) -> Option<(DigestMode, Vec<u8>)> {
    let mut parts = line.split_ascii_whitespace();
    if parts.next()? != "challenge" {
        return None;
    }
    let digest: DigestMode = parts.next()?.parse().ok()?;
    let salt = hex::decode(parts.next()?).ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((digest, salt))
}

fn parse_response_line(line: &str) -> Result<Option<AuthResponse>, ()> {
    let mut parts = line.split_ascii_whitespace();
    match parts.next() {
        Some("noresponse") => match parts.next() {
            None => Ok(None),
            Some(_) => Err(()),
        },
        Some("response") => {
            let digest_hex = parts.next().ok_or(())?;
            if hex::decode(digest_hex).is_err() {
                return Err(());
            }
            let username = parts.next().map(str::to_string);
            if parts.next().is_some() {
                return Err(());
            }
            Ok(Some(AuthResponse::new(digest_hex, username)))
        }
        _ => Err(()),
    }
}

fn parse_verdict_line(line: &str) -> Option<ResultCode> {
    let mut parts = line.split_ascii_whitespace();
    match parts.next()? {
        "ok" => Some(ResultCode::Ok),
        "denied" => ResultCode::parse(parts.next()?),
        _ => None,
    }
}

/// Reads one `\n`-terminated line, byte by byte so nothing beyond the
/// terminator is consumed.  `None` means the peer closed the stream.
async fn read_line(
    conn: &mut dyn Connection,
    timeout: Duration,
) -> Result<Option<String>, xgate_core::ConnectionError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut line = Vec::new();
    loop {
        let byte = tokio::time::timeout_at(deadline, conn.read(1))
            .await
            .map_err(|_| xgate_core::ConnectionError::Timeout)??;
        if byte.is_empty() {
            return Ok(if line.is_empty() { None } else { Some(lossy(line)) });
        }
        if byte[0] == b'\n' {
            return Ok(Some(lossy(line)));
        }
        line.push(byte[0]);
        if line.len() > MAX_LINE {
            return Err(xgate_core::ConnectionError::Protocol(
                "handshake line too long".to_string(),
            ));
        }
    }
}

fn lossy(bytes: Vec<u8>) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge_line() {
        let (digest, salt) = parse_challenge_line("challenge hmac-sha256 00ff").unwrap();
        assert_eq!(digest, DigestMode::HmacSha256);
        assert_eq!(salt, vec![0x00, 0xff]);
        assert!(parse_challenge_line("challenge rot13 00ff").is_none());
        assert!(parse_challenge_line("challenge hmac-sha256 zz").is_none());
        assert!(parse_challenge_line("hello").is_none());
    }

    #[test]
    fn test_parse_response_line() {
        assert_eq!(parse_response_line("noresponse"), Ok(None));
        let parsed = parse_response_line("response abcd").unwrap().unwrap();
        assert_eq!(parsed.digest_hex, "abcd");
        assert_eq!(parsed.username, None);
        let parsed = parse_response_line("response abcd alice").unwrap().unwrap();
        assert_eq!(parsed.username.as_deref(), Some("alice"));
        assert!(parse_response_line("response").is_err());
        assert!(parse_response_line("response not-hex").is_err());
        assert!(parse_response_line("response abcd alice extra").is_err());
        assert!(parse_response_line("gimme").is_err());
    }

    #[test]
    fn test_parse_verdict_line() {
        assert_eq!(parse_verdict_line("ok"), Some(ResultCode::Ok));
        assert_eq!(
            parse_verdict_line("denied PASSWORD_REQUIRED"),
            Some(ResultCode::PasswordRequired)
        );
        assert_eq!(parse_verdict_line("denied WHATEVER"), None);
        assert_eq!(parse_verdict_line("maybe"), None);
    }
}
