//! Configuration management
//!
//! sleepproxy.toml is loaded once at startup, checked by [`validate`] and
//! turned into immutable [`NetworkPlan`]s by [`resolve`]. Nothing reads the
//! configuration after that.

mod resolve;
mod types;
mod validation;

pub use resolve::{resolve, NetworkPlan};
pub use types::*;
pub use validation::{validate, ValidationResult};

use crate::{Error, Result};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(Error::Io)?;
    parse(&content)
}

/// Parse configuration from TOML text
pub fn parse(content: &str) -> Result<Config> {
    toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = include_str!("../../sleepproxy.example.toml");

    #[test]
    fn test_example_config() {
        let config = parse(EXAMPLE).unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.network.len(), 1);

        let network = &config.network[0];
        assert_eq!(network.interface, "eth0");
        assert_eq!(network.host.len(), 5);
        assert_eq!(network.rule.len(), 4);
        assert_eq!(network.host[2].method.silent, Some(true));
        assert_eq!(network.rule[2].action, ActionConfig::MustNot);

        let validation = validate(&config);
        assert!(!validation.has_errors(), "{:?}", validation.errors);

        let plans = resolve(&config).unwrap();
        assert_eq!(plans[0].hosts.len(), 5);
        assert_eq!(plans[0].chains.len(), 3);
    }

    #[test]
    fn test_empty_config() {
        let config = parse("").unwrap();
        assert!(config.network.is_empty());
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_unknown_enum_value() {
        let result = parse(
            r#"
            [[network]]
            name = "lan"
            interface = "eth0"
            scope = "galaxy"
        "#,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            load("/nonexistent/sleepproxy.toml"),
            Err(Error::Io(_))
        ));
    }
}
