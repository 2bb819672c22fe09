//! In-memory token store: one master token plus per-tenant tokens.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tracing::debug;

use super::Token;
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct TokenStore {
    master: RwLock<Option<Token>>,
    tenants: RwLock<HashMap<String, Token>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `token`. A master token without an explicit tenant replaces the
    /// master token; anything else is filed under `tenant` or the token's own
    /// tenant name.
    pub fn add_token(&self, token: Token, tenant: Option<&str>) -> Result<()> {
        if token.is_webtask() {
            return Err(Error::Validation(
                "webtask tokens can not be stored".to_string(),
            ));
        }

        if tenant.is_none() && token.is_master() {
            debug!("master token stored");
            *self.master.write().unwrap_or_else(PoisonError::into_inner) = Some(token);
        } else {
            let name = tenant.unwrap_or(token.tenant_name()).to_string();
            debug!(tenant = %name, "tenant token stored");
            self.tenants
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(name, token);
        }
        Ok(())
    }

    pub fn master_token(&self) -> Option<Token> {
        self.master
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn tenant_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn tenant_token(&self, tenant: &str) -> Option<Token> {
        self.tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant)
            .cloned()
    }

    /// Tenant token if one is stored, else the master token.
    pub fn token_for(&self, tenant: Option<&str>) -> Result<Token> {
        if let Some(token) = tenant.and_then(|t| self.tenant_token(t)) {
            return Ok(token);
        }
        self.master_token().ok_or_else(|| {
            Error::Token(match tenant {
                Some(t) => format!("No tenant token with name, '{t}'."),
                None => "No master token.".to_string(),
            })
        })
    }
}
