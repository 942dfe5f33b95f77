//! Default User-Agent for API and bundle requests.

/// Project URL for User-Agent identification.
const PROJECT_UA_URL: &str = "https://github.com/bundlex/bundlex";

/// Default User-Agent (identifies the tool and its version).
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("bundlex/{version} (ci-file-exchange; +{PROJECT_UA_URL})")
}
