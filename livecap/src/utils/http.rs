//! Shared HTTP client construction.

use std::time::Duration;

/// User agent sent on every outbound request.
pub const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/115.0";

/// Build the shared HTTP client.
///
/// A zero timeout leaves the client without a total-request deadline,
/// which streaming downloads require; per-call deadlines are applied at
/// the call sites instead.
pub fn build_client(timeout: Duration) -> reqwest::Client {
    let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);

    if timeout > Duration::ZERO {
        builder = builder.timeout(timeout);
    }

    builder.build().expect("HTTP client construction")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_and_without_timeout() {
        let _ = build_client(Duration::ZERO);
        let _ = build_client(Duration::from_secs(10));
    }
}
