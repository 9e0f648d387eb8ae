use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    ApiKey,
    Bearer,
    None,
}

/// Resolved identity attached to a request. Never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    pub method: AuthMethod,
    pub subject: Option<String>,
    pub scopes: Vec<String>,
}

impl AuthContext {
    pub fn open() -> Self {
        Self {
            method: AuthMethod::None,
            subject: None,
            scopes: Vec::new(),
        }
    }

    pub fn has_scopes(&self, required: &[&str]) -> bool {
        required.iter().all(|r| self.scopes.iter().any(|s| s == r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_superset_check() {
        let ctx = AuthContext {
            method: AuthMethod::Bearer,
            subject: Some("alice".into()),
            scopes: vec!["job:create".into(), "round:start".into()],
        };
        assert!(ctx.has_scopes(&["job:create"]));
        assert!(ctx.has_scopes(&["job:create", "round:start"]));
        assert!(!ctx.has_scopes(&["token:issue"]));
        assert!(ctx.has_scopes(&[]));
    }
}
