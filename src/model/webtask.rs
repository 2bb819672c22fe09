//! A downloaded webtask: code plus everything a migration has to carry over.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Module;
use crate::token::Token;

const DEPENDENCIES_META: &str = "wt-node-dependencies";
const COMPILER_META: &str = "wt-compiler";

/// Persistent storage attached to a webtask.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Storage {
    /// Stored document, always kept as its JSON text.
    pub data: Option<String>,
    pub etag: Option<String>,
}

impl Storage {
    /// Build from a storage API response; structured data is serialized.
    pub fn from_value(value: &Value) -> Self {
        let data = match value.get("data") {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => Some(text.clone()),
            Some(other) => Some(other.to_string()),
        };
        let etag = value.get("etag").and_then(Value::as_str).map(str::to_string);
        Self { data, etag }
    }
}

/// CRON schedule attached to a webtask.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cron {
    pub schedule: Option<String>,
    pub tz: Option<String>,
    pub state: Option<String>,
    pub meta: Option<Value>,
}

impl Cron {
    pub fn is_empty(&self) -> bool {
        self.schedule.is_none() && self.tz.is_none() && self.state.is_none() && self.meta.is_none()
    }

    pub fn is_active(&self) -> bool {
        self.state.as_deref() == Some("active")
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Webtask {
    pub code: String,
    pub meta: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
    pub storage: Storage,
    pub cron: Cron,
    #[serde(skip)]
    pub token: Option<Token>,
}

impl Webtask {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }

    /// Declared node dependencies. A missing or malformed declaration reads
    /// as none.
    pub fn dependencies(&self) -> Vec<Module> {
        self.dependency_map()
            .into_iter()
            .map(|(name, version)| Module::new(name, version))
            .collect()
    }

    pub fn add_dependencies(&mut self, modules: &[Module]) {
        let mut deps = self.dependency_map();
        for module in modules {
            deps.insert(module.name.clone(), module.version.clone());
        }
        self.store_dependencies(&deps);
    }

    pub fn remove_dependencies(&mut self, modules: &[Module]) {
        let mut deps = self.dependency_map();
        for module in modules {
            deps.remove(&module.name);
        }
        self.store_dependencies(&deps);
    }

    pub fn compiler(&self) -> Option<&str> {
        self.meta.get(COMPILER_META).map(String::as_str)
    }

    /// Claims to carry over when re-issuing this webtask's token.
    pub fn claims(&self) -> serde_json::Map<String, Value> {
        self.token
            .as_ref()
            .map(Token::webtask_claims)
            .unwrap_or_default()
    }

    pub fn host(&self) -> Option<&str> {
        self.token.as_ref().and_then(Token::host)
    }

    pub fn code_url(&self) -> Option<&str> {
        self.token.as_ref().and_then(Token::code_url)
    }

    pub fn is_url_based(&self) -> bool {
        self.code_url().is_some()
    }

    fn dependency_map(&self) -> BTreeMap<String, String> {
        self.meta
            .get(DEPENDENCIES_META)
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    fn store_dependencies(&mut self, deps: &BTreeMap<String, String>) {
        let encoded = serde_json::to_string(deps).unwrap_or_else(|_| "{}".to_string());
        self.meta.insert(DEPENDENCIES_META.to_string(), encoded);
    }
}
