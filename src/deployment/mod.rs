//! Remote deployment API.
//!
//! Every operation resolves a token from the [`TokenStore`], describes the
//! call and hands it to the shared [`Dispatcher`], so all traffic to one
//! deployment shares the same concurrency bound and retry policy. Failures
//! are reported as [`Error::Deployment`] naming the operation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::Method;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::engine::Dispatcher;
use crate::engine::dispatch::CallResult;
use crate::error::{CallError, Error, Result};
use crate::model::{Cron, Module, ModuleStatus, Storage, Webtask, WebtaskInfo};
use crate::producer::{
    DownloaderOptions, ModuleCache, ModuleProvisioner, ModuleSource, ProvisionerOptions,
    WebtaskDownloader, WebtaskSource,
};
use crate::remote::CallDescriptor;
use crate::token::{Token, TokenStore};

/// Largest page the list endpoint accepts.
pub const MAX_LIST_LIMIT: usize = 100;
/// Largest module batch the provisioning endpoint accepts.
pub const MAX_PROVISION_BATCH: usize = 50;

/// Characters left alone by JavaScript's `encodeURIComponent`.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// What to fetch besides the webtask itself.
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Ask the deployment to decrypt secrets.
    pub include_secrets: bool,
    pub include_storage: bool,
    pub include_cron: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Upload with a plain PUT even if the webtask token carries claims.
    pub ignore_claims: bool,
    /// Write storage without the etag precondition.
    pub overwrite_storage: bool,
    /// Only (re)create the CRON job.
    pub cron_only: bool,
}

/// One remote deployment.
#[derive(Clone)]
pub struct Deployment {
    token_store: Arc<TokenStore>,
    dispatcher: Dispatcher,
    module_cache: ModuleCache,
}

impl Deployment {
    pub fn new(token_store: Arc<TokenStore>, dispatcher: Dispatcher) -> Self {
        Self {
            token_store,
            dispatcher,
            module_cache: ModuleCache::new(),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn token_store(&self) -> &Arc<TokenStore> {
        &self.token_store
    }

    /// Modules known to be available on this deployment.
    pub fn module_cache(&self) -> &ModuleCache {
        &self.module_cache
    }

    /// Issue a tenant token with the master token and store it.
    pub async fn create_tenant(&self, tenant: &str, claims: Map<String, Value>) -> Result<Token> {
        require("tenant", tenant)?;
        let master = self
            .token_store
            .master_token()
            .ok_or_else(|| Error::Token("No master token.".to_string()))?;

        let mut body = claims;
        body.insert("ten".to_string(), Value::String(tenant.to_string()));
        let call = CallDescriptor::new(Method::POST, "api/tokens/issue")
            .credential(master.secret())
            .body(Value::Object(body));

        let issued = self
            .dispatcher
            .call(call)
            .await
            .map_err(failed("create the tenant"))?;
        let encoded = match issued {
            Some(Value::String(encoded)) => encoded,
            other => {
                return Err(Error::Token(format!(
                    "token issue returned no token: {other:?}"
                )));
            }
        };

        let token = Token::parse(encoded.trim())?;
        self.token_store.add_token(token.clone(), None)?;
        info!(tenant, "tenant created");
        Ok(token)
    }

    /// One page of webtasks, across all tenants when `tenant` is `None`.
    pub async fn list_webtasks(
        &self,
        tenant: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<WebtaskInfo>> {
        if limit == 0 || limit > MAX_LIST_LIMIT {
            return Err(Error::Validation(format!(
                "limit max value is {MAX_LIST_LIMIT}"
            )));
        }
        let token = self.token_store.token_for(tenant)?;

        let path = match tenant {
            Some(tenant) => format!("api/webtask/{}", encode(tenant)),
            None => "api/webtask".to_string(),
        };
        let call = CallDescriptor::get(format!("{path}?offset={offset}&limit={limit}"))
            .credential(token.secret());

        let listed = self
            .dispatcher
            .call(call)
            .await
            .map_err(failed("download the list of webtasks"))?;

        let entries = match listed {
            Some(Value::Array(entries)) => entries,
            _ => Vec::new(),
        };
        Ok(entries
            .iter()
            .filter_map(|entry| {
                let tenant = entry.get("container")?.as_str()?;
                let name = entry.get("name")?.as_str()?;
                Some(WebtaskInfo::new(tenant, name))
            })
            .collect())
    }

    /// Fetch a webtask plus the requested extras. The requests run
    /// concurrently; `None` if the webtask does not exist.
    pub async fn download_webtask(
        &self,
        tenant: &str,
        name: &str,
        options: &DownloadOptions,
    ) -> Result<Option<Webtask>> {
        require("tenant", tenant)?;
        require("webtask", name)?;
        let token = self.token_store.token_for(Some(tenant))?;
        let path = format!("{}/{}", encode(tenant), encode(name));

        let webtask_call = CallDescriptor::get(format!(
            "api/webtask/{path}?decrypt={}&fetch_code=true",
            options.include_secrets
        ))
        .credential(token.secret());
        let storage_call =
            CallDescriptor::get(format!("api/webtask/{path}/data")).credential(token.secret());
        let cron_call = CallDescriptor::get(format!("api/cron/{path}")).credential(token.secret());

        let (webtask, storage, cron) = tokio::try_join!(
            self.dispatcher.call(webtask_call),
            self.optional_call(options.include_storage, storage_call),
            self.optional_call(options.include_cron, cron_call),
        )
        .map_err(failed("download the webtask"))?;

        let Some(webtask) = webtask else {
            return Ok(None);
        };

        let mut downloaded = Webtask::new(
            webtask.get("code").and_then(Value::as_str).unwrap_or_default(),
        );
        downloaded.meta = string_map(webtask.get("meta"));
        downloaded.secrets = string_map(webtask.get("secrets"));
        downloaded.token = match webtask.get("token").and_then(Value::as_str) {
            Some(encoded) => match Token::for_tenant(encoded, tenant) {
                Ok(token) => Some(token),
                Err(error) => {
                    warn!(tenant, name, %error, "webtask token could not be decoded");
                    None
                }
            },
            None => None,
        };
        if let Some(storage) = storage {
            downloaded.storage = Storage::from_value(&storage);
        }
        if let Some(cron) = cron {
            downloaded.cron = serde_json::from_value::<Cron>(cron).unwrap_or_default();
        }

        debug!(tenant, name, "webtask downloaded");
        Ok(Some(downloaded))
    }

    /// Upload a webtask, then its storage and CRON job.
    pub async fn upload_webtask(
        &self,
        tenant: &str,
        name: &str,
        webtask: &Webtask,
        options: &UploadOptions,
    ) -> Result<()> {
        require("tenant", tenant)?;
        require("webtask", name)?;
        let token = self.token_store.token_for(Some(tenant))?;

        if !options.cron_only {
            self.upload_code(&token, tenant, name, webtask, options.ignore_claims)
                .await?;
            self.upload_storage(&token, tenant, name, webtask, options.overwrite_storage)
                .await?;
        }
        self.upload_cron(&token, tenant, name, webtask).await?;

        info!(tenant, name, cron_only = options.cron_only, "webtask uploaded");
        Ok(())
    }

    pub async fn delete_webtask(&self, tenant: &str, name: &str) -> Result<()> {
        require("tenant", tenant)?;
        require("webtask", name)?;
        let token = self.token_store.token_for(Some(tenant))?;

        let call = CallDescriptor::new(
            Method::DELETE,
            format!("api/webtask/{}/{}", encode(tenant), encode(name)),
        )
        .credential(token.secret());
        self.dispatcher
            .call(call)
            .await
            .map_err(failed("delete the webtask"))?;

        info!(tenant, name, "webtask deleted");
        Ok(())
    }

    /// Submit one batch of modules and report the state of each.
    pub async fn provision_modules(
        &self,
        modules: &[Module],
        tenant: Option<&str>,
    ) -> Result<Vec<ModuleStatus>> {
        if modules.len() > MAX_PROVISION_BATCH {
            return Err(Error::Validation(format!(
                "modules.length max value is {MAX_PROVISION_BATCH}"
            )));
        }
        for module in modules {
            module.validate()?;
        }
        let token = self.token_store.token_for(tenant)?;

        let call = CallDescriptor::new(Method::POST, "api/env/node/modules")
            .credential(token.secret())
            .body(json!({ "modules": modules }));
        let response = self
            .dispatcher
            .call(call)
            .await
            .map_err(failed("provision the modules"))?;

        match response {
            Some(body) => serde_json::from_value(body)
                .map_err(|e| Error::Other(format!("unexpected provisioning response: {e}"))),
            None => Err(Error::Other(
                "module provisioning is not available on this deployment".to_string(),
            )),
        }
    }

    /// Options for a downloader on this deployment, one lane per dispatcher slot.
    pub fn downloader_options(&self) -> DownloaderOptions {
        DownloaderOptions {
            lanes: self.dispatcher.max_concurrent(),
            ..DownloaderOptions::default()
        }
    }

    /// Options for a provisioner on this deployment, one lane per dispatcher slot.
    pub fn provisioner_options(&self) -> ProvisionerOptions {
        ProvisionerOptions {
            lanes: self.dispatcher.max_concurrent(),
            ..ProvisionerOptions::default()
        }
    }

    pub fn downloader(&self, options: DownloaderOptions) -> Result<WebtaskDownloader> {
        WebtaskDownloader::new(Arc::new(self.clone()), options)
    }

    /// A provisioner sharing this deployment's module cache.
    pub fn provisioner(
        &self,
        modules: Vec<Module>,
        options: ProvisionerOptions,
    ) -> Result<ModuleProvisioner> {
        ModuleProvisioner::new(
            Arc::new(self.clone()),
            modules,
            self.module_cache.clone(),
            options,
        )
    }

    async fn optional_call(&self, wanted: bool, call: CallDescriptor) -> CallResult {
        if wanted {
            self.dispatcher.call(call).await
        } else {
            Ok(None)
        }
    }

    async fn upload_code(
        &self,
        token: &Token,
        tenant: &str,
        name: &str,
        webtask: &Webtask,
        ignore_claims: bool,
    ) -> Result<()> {
        let claims = webtask.claims();
        let (method, path, mut body) = if ignore_claims || claims.is_empty() {
            let mut body = Map::new();
            if !webtask.secrets.is_empty() {
                body.insert("secrets".to_string(), json!(webtask.secrets));
            }
            (
                Method::PUT,
                format!("api/webtask/{}/{}", encode(tenant), encode(name)),
                body,
            )
        } else {
            // Re-issue the webtask token so its claims carry over.
            let mut body = claims;
            body.insert("jtn".to_string(), json!(name));
            body.insert("ten".to_string(), json!(tenant));
            if !webtask.secrets.is_empty() {
                body.insert("ectx".to_string(), json!(webtask.secrets));
            }
            (Method::POST, "api/tokens/issue".to_string(), body)
        };

        match webtask.code_url() {
            Some(url) => body.insert("url".to_string(), json!(url)),
            None => body.insert("code".to_string(), json!(webtask.code)),
        };
        if !webtask.meta.is_empty() {
            body.insert("meta".to_string(), json!(webtask.meta));
        }
        if let Some(host) = webtask.host() {
            body.insert("host".to_string(), json!(host));
        }

        let call = CallDescriptor::new(method, path)
            .credential(token.secret())
            .body(Value::Object(body));
        self.dispatcher
            .call(call)
            .await
            .map_err(failed("upload the webtask"))?;
        Ok(())
    }

    async fn upload_storage(
        &self,
        token: &Token,
        tenant: &str,
        name: &str,
        webtask: &Webtask,
        overwrite: bool,
    ) -> Result<()> {
        let Some(data) = &webtask.storage.data else {
            return Ok(());
        };

        let mut body = json!({ "data": data });
        if !overwrite {
            body["etag"] = json!(webtask.storage.etag);
        }
        let call = CallDescriptor::new(
            Method::PUT,
            format!("api/webtask/{}/{}/data", encode(tenant), encode(name)),
        )
        .credential(token.secret())
        .body(body);
        self.dispatcher
            .call(call)
            .await
            .map_err(failed("upload the storage data to the webtask"))?;
        Ok(())
    }

    async fn upload_cron(
        &self,
        token: &Token,
        tenant: &str,
        name: &str,
        webtask: &Webtask,
    ) -> Result<()> {
        let cron = &webtask.cron;
        if cron.is_empty() {
            return Ok(());
        }

        let body = json!({
            "tz": cron.tz,
            "meta": cron.meta,
            "schedule": cron.schedule,
            "state": cron.state,
        });
        let call = CallDescriptor::new(
            Method::PUT,
            format!("api/cron/{}/{}", encode(tenant), encode(name)),
        )
        .credential(token.secret())
        .body(body);
        self.dispatcher
            .call(call)
            .await
            .map_err(failed("create the CRON job"))?;
        Ok(())
    }
}

#[async_trait]
impl WebtaskSource for Deployment {
    async fn list_page(
        &self,
        tenant: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<WebtaskInfo>> {
        self.list_webtasks(tenant, offset, limit).await
    }

    async fn fetch_webtask(
        &self,
        tenant: &str,
        name: &str,
        options: &DownloadOptions,
    ) -> Result<Option<Webtask>> {
        self.download_webtask(tenant, name, options).await
    }
}

#[async_trait]
impl ModuleSource for Deployment {
    async fn submit_batch(
        &self,
        modules: &[Module],
        tenant: Option<&str>,
    ) -> Result<Vec<ModuleStatus>> {
        self.provision_modules(modules, tenant).await
    }
}

fn encode(segment: &str) -> String {
    utf8_percent_encode(segment, PATH_SEGMENT).to_string()
}

fn require(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Validation(format!("{what} name required")));
    }
    Ok(())
}

fn failed(action: &'static str) -> impl Fn(CallError) -> Error {
    move |source| Error::Deployment { action, source }
}

/// Flatten a JSON object into strings; non-string values keep their JSON text.
fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    let Some(Value::Object(entries)) = value else {
        return BTreeMap::new();
    };
    entries
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}
