//! Migration-risk analysis of downloaded webtasks.
//!
//! Static code analysis lives behind the [`Analyzer`] trait. The built-in
//! [`DependencyAnalyzer`] only looks at what the webtask declares: its node
//! dependencies and the settings that need manual attention after a move.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::{Module, Webtask};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub dependencies: Vec<Module>,
    pub warnings: Vec<Warning>,
}

impl Analysis {
    pub fn has_warning(&self, kind: WarningKind) -> bool {
        self.warnings.iter().any(|w| w.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WarningKind {
    ActiveCron,
    HostDetected,
    UnknownCompiler,
    UrlBased,
}

impl WarningKind {
    fn message(self) -> &'static str {
        match self {
            WarningKind::ActiveCron => {
                "The CRON job state is 'active' on both the new and old deployments and will \
                 run in both environments. Consider disabling the CRON job in one of the deployments."
            }
            WarningKind::HostDetected => {
                "The webtask uses a host value to support a custom domain name. Update the \
                 CNAME record with your hosting service to support the new deployment."
            }
            WarningKind::UnknownCompiler => {
                "The webtask uses a compiler; its dependencies may not be visible to analysis."
            }
            WarningKind::UrlBased => {
                "The webtask code is loaded from an external URL that must stay reachable \
                 from the new deployment."
            }
        }
    }
}

impl From<WarningKind> for Warning {
    fn from(kind: WarningKind) -> Self {
        Self {
            kind,
            message: kind.message().to_string(),
        }
    }
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, webtask: &Webtask) -> anyhow::Result<Analysis>;
}

/// Reports declared dependencies and settings that need manual follow-up.
#[derive(Debug, Default, Clone, Copy)]
pub struct DependencyAnalyzer;

#[async_trait]
impl Analyzer for DependencyAnalyzer {
    async fn analyze(&self, webtask: &Webtask) -> anyhow::Result<Analysis> {
        let mut warnings = Vec::new();
        if webtask.cron.is_active() {
            warnings.push(WarningKind::ActiveCron.into());
        }
        if webtask.host().is_some() {
            warnings.push(WarningKind::HostDetected.into());
        }
        if webtask.compiler().is_some() {
            warnings.push(WarningKind::UnknownCompiler.into());
        }
        if webtask.is_url_based() {
            warnings.push(WarningKind::UrlBased.into());
        }

        Ok(Analysis {
            dependencies: webtask.dependencies(),
            warnings,
        })
    }
}
