use std::path::Path;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::config::Config;
use crate::error::{Error, Result};

static ENV_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env-ref pattern"));

/// Load, env-expand, parse, and validate a configuration file.
///
/// The format is selected by extension: `.yaml`/`.yml` or `.toml`.
/// `${VAR}` references are expanded from the process environment before
/// parsing; an unset variable expands to the empty string.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)?;
    let expanded = expand_env(&raw);

    let config: Config = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_str(&expanded)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?,
        Some("toml") => toml::from_str(&expanded)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?,
        other => {
            return Err(Error::Config(format!(
                "unsupported config extension {:?} for {}",
                other,
                path.display()
            )));
        }
    };

    config.validate()?;
    Ok(config)
}

fn expand_env(raw: &str) -> String {
    ENV_REF
        .replace_all(raw, |caps: &Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_known_variables() {
        std::env::set_var("RELAY_TEST_SECRET", "sk-from-env");
        let out = expand_env("secret: ${RELAY_TEST_SECRET}");
        assert_eq!(out, "secret: sk-from-env");
    }

    #[test]
    fn unset_variables_expand_to_empty() {
        std::env::remove_var("RELAY_TEST_MISSING");
        let out = expand_env("secret: '${RELAY_TEST_MISSING}'");
        assert_eq!(out, "secret: ''");
    }

    #[test]
    fn non_references_pass_through() {
        let out = expand_env("listen: 0.0.0.0:8082 # $HOME style refs stay");
        assert_eq!(out, "listen: 0.0.0.0:8082 # $HOME style refs stay");
    }
}
