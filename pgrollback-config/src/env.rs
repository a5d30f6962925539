use pgrollback_core::err::{Context, Result};

/// The environment overrides recognised by the loader.
///
/// Each entry maps one environment variable onto one setting in the
/// yaml document. Environment always wins over the file.
const OVERRIDES: &[EnvOverride] = &[
    EnvOverride::string("PGROLLBACK_BACKEND_HOST", &["backend", "host"]),
    EnvOverride::number("PGROLLBACK_BACKEND_PORT", &["backend", "port"]),
    EnvOverride::string("PGROLLBACK_BACKEND_DATABASE", &["backend", "database"]),
    EnvOverride::string("PGROLLBACK_BACKEND_USER", &["backend", "user"]),
    EnvOverride::string("PGROLLBACK_BACKEND_PASSWORD", &["backend", "password"]),
    EnvOverride::string("PGROLLBACK_LISTEN_HOST", &["proxy", "host"]),
    EnvOverride::number("PGROLLBACK_LISTEN_PORT", &["proxy", "port"]),
    EnvOverride::number(
        "PGROLLBACK_IDLE_TIMEOUT_SECS",
        &["session", "idle_timeout_secs"],
    ),
    EnvOverride::number(
        "PGROLLBACK_KEEPALIVE_INTERVAL_SECS",
        &["session", "keepalive_interval_secs"],
    ),
];

struct EnvOverride {
    var: &'static str,
    path: &'static [&'static str],
    numeric: bool,
}

impl EnvOverride {
    const fn string(var: &'static str, path: &'static [&'static str]) -> Self {
        Self {
            var,
            path,
            numeric: false,
        }
    }

    const fn number(var: &'static str, path: &'static [&'static str]) -> Self {
        Self {
            var,
            path,
            numeric: true,
        }
    }
}

/// Applies the recognised environment overrides onto the supplied yaml
/// document, creating intermediate mappings as required.
///
/// The lookup is injected so tests do not need to mutate the process
/// environment.
pub fn apply_overrides(
    conf: &mut serde_yaml::Value,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    for o in OVERRIDES {
        let raw = match lookup(o.var) {
            Some(v) => v,
            None => continue,
        };

        let value = if o.numeric {
            let num: u64 = raw
                .parse()
                .with_context(|| format!("{} must be numeric, got \"{}\"", o.var, raw))?;
            serde_yaml::Value::Number(num.into())
        } else {
            serde_yaml::Value::String(raw)
        };

        set_path(conf, o.path, value);
    }

    Ok(())
}

fn set_path(conf: &mut serde_yaml::Value, path: &[&str], value: serde_yaml::Value) {
    let mut node = conf;

    for key in &path[..path.len() - 1] {
        if !node.is_mapping() {
            *node = serde_yaml::Value::Mapping(Default::default());
        }

        let map = node.as_mapping_mut().unwrap();
        let key = serde_yaml::Value::String(key.to_string());
        node = map
            .entry(key)
            .or_insert_with(|| serde_yaml::Value::Mapping(Default::default()));
    }

    if !node.is_mapping() {
        *node = serde_yaml::Value::Mapping(Default::default());
    }

    node.as_mapping_mut().unwrap().insert(
        serde_yaml::Value::String(path.last().unwrap().to_string()),
        value,
    );
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_env_no_overrides_leaves_config_untouched() {
        let mut conf: serde_yaml::Value = serde_yaml::from_str("backend: {host: a}").unwrap();
        let orig = conf.clone();

        apply_overrides(&mut conf, lookup(&[])).unwrap();

        assert_eq!(conf, orig);
    }

    #[test]
    fn test_env_overrides_existing_value() {
        let mut conf: serde_yaml::Value =
            serde_yaml::from_str("backend: {host: from-file}").unwrap();

        apply_overrides(&mut conf, lookup(&[("PGROLLBACK_BACKEND_HOST", "from-env")])).unwrap();

        assert_eq!(conf["backend"]["host"], serde_yaml::Value::from("from-env"));
    }

    #[test]
    fn test_env_creates_missing_mappings() {
        let mut conf = serde_yaml::Value::Null;

        apply_overrides(
            &mut conf,
            lookup(&[
                ("PGROLLBACK_BACKEND_HOST", "h"),
                ("PGROLLBACK_LISTEN_PORT", "15433"),
            ]),
        )
        .unwrap();

        assert_eq!(conf["backend"]["host"], serde_yaml::Value::from("h"));
        assert_eq!(conf["proxy"]["port"], serde_yaml::Value::from(15433));
    }

    #[test]
    fn test_env_numeric_override_rejects_garbage() {
        let mut conf = serde_yaml::Value::Null;

        apply_overrides(&mut conf, lookup(&[("PGROLLBACK_BACKEND_PORT", "not-a-port")]))
            .unwrap_err();
    }
}
