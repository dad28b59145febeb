//! Named credentials, resolved at the last moment and never printed.

use std::collections::HashMap;
use std::env;
use std::fmt::{Debug, Display, Formatter};

use crate::error::SecretError;

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use crate::error::SecretError;
    use crate::secrets::{Redactor, SecretStore};

    fn store() -> SecretStore {
        let mut m = HashMap::new();
        m.insert("RENDER_API_KEY".to_string(), "rnd_s3cr3t".to_string());
        m.insert("EMPTY".to_string(), "".to_string());
        SecretStore::from_map(m)
    }

    #[test]
    fn secrets_never_format() {
        let s = store().resolve("RENDER_API_KEY").unwrap();
        assert_eq!(s.expose(), "rnd_s3cr3t");
        assert_eq!(format!("{}", s), "***");
        assert_eq!(format!("{:?}", s), "Secret(***)");
    }

    #[test]
    fn missing_secret() {
        assert_eq!(
            store().resolve("VERCEL_TOKEN").unwrap_err(),
            SecretError::Missing {
                name: "VERCEL_TOKEN".into()
            }
        );
    }

    #[test]
    fn redaction() {
        let store = store();
        let secrets = vec![
            store.resolve("RENDER_API_KEY").unwrap(),
            store.resolve("EMPTY").unwrap(),
        ];
        let r = Redactor::new(&secrets);
        assert_eq!(
            r.redact("curl -H 'Authorization: Bearer rnd_s3cr3t'"),
            "curl -H 'Authorization: Bearer ***'"
        );
        assert_eq!(r.redact("nothing here"), "nothing here");
    }

    #[test]
    fn environment_store() {
        std::env::set_var("RELAYCI_TEST_SECRET", "from-env");
        let s = SecretStore::from_env().resolve("RELAYCI_TEST_SECRET").unwrap();
        assert_eq!(s.expose(), "from-env");
    }
}

#[derive(Clone, PartialEq, Eq)]
/// A resolved secret value. Formats as `***`.
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Debug for Secret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl Display for Secret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("***")
    }
}

#[derive(Clone, Default)]
enum Source {
    #[default]
    Environment,
    Static(HashMap<String, String>),
}

#[derive(Clone, Default)]
/// Resolves secret names to values. Defaults to the process environment.
pub struct SecretStore {
    source: Source,
}

impl Debug for SecretStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.source {
            Source::Environment => f.write_str("SecretStore(env)"),
            Source::Static(m) => write!(f, "SecretStore({} static)", m.len()),
        }
    }
}

impl SecretStore {
    pub fn from_env() -> Self {
        SecretStore {
            source: Source::Environment,
        }
    }

    pub fn from_map(values: HashMap<String, String>) -> Self {
        SecretStore {
            source: Source::Static(values),
        }
    }

    pub fn resolve(&self, name: &str) -> Result<Secret, SecretError> {
        let value = match &self.source {
            Source::Environment => env::var(name).ok(),
            Source::Static(m) => m.get(name).cloned(),
        };
        value.map(Secret).ok_or_else(|| SecretError::Missing {
            name: name.to_string(),
        })
    }
}

#[derive(Default)]
/// Masks secret values in captured output
pub struct Redactor {
    values: Vec<String>,
}

impl Redactor {
    pub fn new(secrets: &[Secret]) -> Self {
        let mut values: Vec<String> = secrets
            .iter()
            .map(|s| s.expose().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        // longest first, so a secret containing another is masked whole
        values.sort_by_key(|v| std::cmp::Reverse(v.len()));
        Redactor { values }
    }

    pub fn redact(&self, s: &str) -> String {
        self.values
            .iter()
            .fold(s.to_string(), |acc, v| acc.replace(v.as_str(), "***"))
    }
}
