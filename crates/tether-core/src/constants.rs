//! Package-level constants.

/// Current version of the relay (sourced from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package name.
pub const NAME: &str = "tether";

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "TETHER_";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_semver() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert_eq!(parts.len(), 3, "VERSION must be semver (MAJOR.MINOR.PATCH)");
        for part in parts {
            let _: u32 = part.parse().expect("each semver segment must be a number");
        }
    }

    #[test]
    fn env_prefix_matches_name() {
        assert_eq!(ENV_PREFIX, format!("{}_", NAME.to_uppercase()));
    }
}
