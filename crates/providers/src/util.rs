use valet_domain::error::Error;

/// Map a reqwest error into our error taxonomy.
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

/// Turn a non-success HTTP status + body into a provider error, preserving
/// status and body text for the classifier.
pub(crate) fn status_error(provider: &str, status: reqwest::StatusCode, body: &str) -> Error {
    Error::Provider {
        provider: provider.to_owned(),
        message: format!("{} {}", status.as_u16(), body.trim()),
    }
}
