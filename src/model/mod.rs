//! Core data model.
//!
//! Webtasks are enumerated as [`WebtaskInfo`] (tenant + name, later filled
//! with the downloaded [`Webtask`] and its analysis). Node modules are
//! identified by [`Module`] and resolved by the deployment to a
//! [`ModuleState`].

pub mod webtask;

pub use webtask::{Cron, Storage, Webtask};

use serde::{Deserialize, Serialize};

use crate::analysis::Analysis;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Webtasks
// ---------------------------------------------------------------------------

/// A webtask discovered by enumeration.
#[derive(Debug, Clone, Serialize)]
pub struct WebtaskInfo {
    pub tenant: String,
    pub name: String,
    /// Present once downloaded (absent in names-only runs).
    pub webtask: Option<Webtask>,
    pub analysis: Option<Analysis>,
}

impl WebtaskInfo {
    pub fn new(tenant: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            name: name.into(),
            webtask: None,
            analysis: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Modules
// ---------------------------------------------------------------------------

/// A node module at an exact version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub version: String,
}

impl Module {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation("module.name(string) required".to_string()));
        }
        if self.version.is_empty() {
            return Err(Error::Validation(
                "module.version(string) required".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Display for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Parses `name@version`; scoped names (`@scope/name@1.0.0`) are supported.
impl std::str::FromStr for Module {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        // Skip a leading '@' so the scope marker is not taken as the separator.
        let split = s
            .char_indices()
            .skip(1)
            .find(|&(_, c)| c == '@')
            .map(|(i, _)| i);
        let module = match split {
            Some(i) => Module::new(&s[..i], &s[i + 1..]),
            None => return Err(Error::Validation(format!("expected name@version, got '{s}'"))),
        };
        module.validate()?;
        Ok(module)
    }
}

/// Resolution state reported by the deployment for one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Available,
    Failed,
    /// Still resolving; anything the deployment reports besides the two
    /// terminal states lands here.
    #[serde(other)]
    Queued,
}

/// One entry of a batch submission response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleStatus {
    pub name: String,
    pub version: String,
    pub state: ModuleState,
}

impl ModuleStatus {
    pub fn module(&self) -> Module {
        Module::new(&self.name, &self.version)
    }
}
