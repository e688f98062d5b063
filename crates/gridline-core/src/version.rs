//! Build version reported by `/healthz` and the `Server` header.

use once_cell::sync::Lazy;

pub const SEMVER: &str = env!("CARGO_PKG_VERSION");

/// Commit hash injected by CI through `GRIDLINE_GIT_HASH`; `dev` for local builds.
pub const GIT_HASH: &str = match option_env!("GRIDLINE_GIT_HASH") {
    Some(hash) => hash,
    None => "dev",
};

pub static VERSION: Lazy<String> = Lazy::new(|| format!("v{}+{}", SEMVER, GIT_HASH));

/// Full version string, e.g. `v0.3.0+dev`.
pub fn string() -> &'static str {
    VERSION.as_str()
}

/// Local builds log relayed bodies at debug level.
pub fn is_debug() -> bool {
    GIT_HASH == "dev"
}

/// Value for the `Server` response header.
pub fn server_header() -> String {
    format!("gridline/{}", string())
}
