//! Remote URL manipulation: token injection, host rewriting, redaction.

use url::Url;

use crate::config::DomainMapping;
use crate::errors::GitError;

/// Build the URL used for authenticated fetch/push.
///
/// For http(s) remotes a `.git` suffix is enforced (some hosts redirect
/// without it and drop credentials on the way) and `oauth2:<token>` is set
/// as user-info. Other remotes (ssh, file, local paths) are returned as-is.
pub fn inject_token(git_url: &str, token: &str) -> Result<String, GitError> {
    if !is_http(git_url) {
        return Ok(git_url.to_string());
    }

    let mut with_suffix = git_url.trim_end_matches('/').to_string();
    if !with_suffix.ends_with(".git") {
        with_suffix.push_str(".git");
    }
    let mut url = Url::parse(&with_suffix)
        .map_err(|e| GitError::InvalidUrl(format!("{}: {}", redact_url(git_url), e)))?;
    if !token.is_empty() {
        url.set_username("oauth2")
            .and_then(|_| url.set_password(Some(token)))
            .map_err(|_| GitError::InvalidUrl(redact_url(git_url)))?;
    }
    Ok(url.to_string())
}

/// Replace the host according to the first mapping whose `from` matches
/// case-insensitively. Unparseable URLs and unmatched hosts pass through.
pub fn rewrite_host(git_url: &str, mappings: &[DomainMapping]) -> String {
    if mappings.is_empty() {
        return git_url.to_string();
    }
    let Ok(mut url) = Url::parse(git_url) else {
        return git_url.to_string();
    };
    let Some(host) = url.host_str().map(str::to_string) else {
        return git_url.to_string();
    };
    for mapping in mappings {
        if host.eq_ignore_ascii_case(&mapping.from) {
            if url.set_host(Some(&mapping.to)).is_err() {
                tracing::warn!(to = %mapping.to, "Invalid git domain mapping target, keeping original host");
                return git_url.to_string();
            }
            tracing::info!(from = %host, to = %mapping.to, "Rewrote git remote host");
            return url.to_string();
        }
    }
    git_url.to_string()
}

/// Replace every occurrence of `secret` with `***`.
pub fn redact(text: &str, secret: &str) -> String {
    if secret.is_empty() {
        return text.to_string();
    }
    let mut out = text.to_string();
    // Git echoes the auth URL, where the token appears percent-encoded.
    if let Some(encoded) = encoded_password(secret) {
        if encoded != secret {
            out = out.replace(&encoded, "***");
        }
    }
    out.replace(secret, "***")
}

/// The token as `inject_token` writes it into the URL's user-info.
fn encoded_password(secret: &str) -> Option<String> {
    let mut url = Url::parse("https://redact.invalid/").ok()?;
    url.set_password(Some(secret)).ok()?;
    url.password().map(str::to_string)
}

/// Strip any user-info from a URL for display.
pub fn redact_url(git_url: &str) -> String {
    match Url::parse(git_url) {
        Ok(mut url) if !url.username().is_empty() || url.password().is_some() => {
            let _ = url.set_username("");
            let _ = url.set_password(None);
            url.to_string()
        }
        _ => git_url.to_string(),
    }
}

fn is_http(git_url: &str) -> bool {
    let lower = git_url.to_ascii_lowercase();
    lower.starts_with("https://") || lower.starts_with("http://")
}
