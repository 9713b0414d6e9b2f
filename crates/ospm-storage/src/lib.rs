//! Durable JSON stores + the outbound workflow trigger client.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use ospm_core::{default_catalog, EmailAddress, EmailError, Program};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ospm-storage";

/// File locations of every durable resource, relative to one data directory.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    pub catalog: PathBuf,
    pub catalog_cache: PathBuf,
    pub subscriptions: PathBuf,
    pub ledger: PathBuf,
}

impl StoreLayout {
    pub fn under(data_dir: impl AsRef<Path>) -> Self {
        let root = data_dir.as_ref();
        Self {
            catalog: root.join("programs.json"),
            catalog_cache: root.join("frontend").join("programs-cache.json"),
            subscriptions: root.join("backend").join("subscriptions.json"),
            ledger: root.join("backend").join("sent_notifications.json"),
        }
    }

    pub fn from_env() -> Self {
        let data_dir = std::env::var("OSPM_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self::under(data_dir)
    }
}

/// Reads and decodes a JSON file. A missing file is `Ok(None)`.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    let value = serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}

/// Replaces `path` with the pretty-printed JSON of `value` via temp-file rename,
/// so readers never observe a partially written file.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value).context("serializing json document")?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(&bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Where a loaded catalog came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogSource {
    Primary,
    Cache,
    BuiltIn,
}

#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    pub programs: Vec<Program>,
    pub source: CatalogSource,
    /// The primary file exists but some or all of it could not be decoded.
    /// Writing a transformed snapshot back would drop those records.
    pub primary_damaged: bool,
}

struct CatalogFile {
    programs: Vec<Program>,
    damaged: bool,
}

/// Decodes a catalog file one record at a time, skipping records that do not
/// fit the schema. `None` when the file does not exist.
async fn read_catalog_file(path: &Path) -> Option<CatalogFile> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(path = %path.display(), "catalog file unreadable: {err}");
            return Some(CatalogFile {
                programs: Vec::new(),
                damaged: true,
            });
        }
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Some(CatalogFile {
            programs: Vec::new(),
            damaged: false,
        });
    }

    let records: Vec<serde_json::Value> = match serde_json::from_slice(&bytes) {
        Ok(records) => records,
        Err(err) => {
            warn!(path = %path.display(), "catalog file is not a JSON array: {err}");
            return Some(CatalogFile {
                programs: Vec::new(),
                damaged: true,
            });
        }
    };

    let mut programs = Vec::with_capacity(records.len());
    let mut damaged = false;
    for (index, record) in records.into_iter().enumerate() {
        match serde_json::from_value::<Program>(record) {
            Ok(program) => programs.push(program),
            Err(err) => {
                damaged = true;
                warn!(path = %path.display(), index, "skipping undecodable catalog record: {err}");
            }
        }
    }
    Some(CatalogFile { programs, damaged })
}

/// Program catalog persisted as a JSON array, mirrored to a cache copy that
/// serves as the first fallback.
#[derive(Debug)]
pub struct CatalogStore {
    primary: PathBuf,
    cache: PathBuf,
    write_lock: Mutex<()>,
}

impl CatalogStore {
    pub fn new(primary: impl Into<PathBuf>, cache: impl Into<PathBuf>) -> Self {
        Self {
            primary: primary.into(),
            cache: cache.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn from_layout(layout: &StoreLayout) -> Self {
        Self::new(layout.catalog.clone(), layout.catalog_cache.clone())
    }

    /// Never fails: primary file, then cache, then the built-in catalog.
    pub async fn load(&self) -> Vec<Program> {
        self.snapshot().await.programs
    }

    pub async fn snapshot(&self) -> CatalogSnapshot {
        let mut primary_damaged = false;
        for (source, path) in [
            (CatalogSource::Primary, &self.primary),
            (CatalogSource::Cache, &self.cache),
        ] {
            match read_catalog_file(path).await {
                Some(file) => {
                    if source == CatalogSource::Primary {
                        primary_damaged = file.damaged;
                    }
                    if !file.programs.is_empty() {
                        return CatalogSnapshot {
                            programs: file.programs,
                            source,
                            primary_damaged,
                        };
                    }
                    warn!(path = %path.display(), "catalog file holds no usable programs");
                }
                None => warn!(path = %path.display(), "catalog file missing"),
            }
        }
        warn!("using built-in fallback catalog");
        CatalogSnapshot {
            programs: default_catalog(),
            source: CatalogSource::BuiltIn,
            primary_damaged,
        }
    }

    pub async fn save(&self, programs: &[Program]) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        self.save_unlocked(programs).await
    }

    /// Load, transform and save under the write lock. An `Err` from `f` leaves
    /// the files untouched and is handed back in the inner result. Refuses to
    /// run when the primary file holds records that could not be decoded.
    pub async fn modify<R, E>(
        &self,
        f: impl FnOnce(Vec<Program>) -> Result<(Vec<Program>, R), E>,
    ) -> anyhow::Result<Result<R, E>> {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.snapshot().await;
        if snapshot.primary_damaged {
            anyhow::bail!(
                "refusing to rewrite {}: it holds records that could not be decoded",
                self.primary.display()
            );
        }
        let (next, result) = match f(snapshot.programs) {
            Ok(transformed) => transformed,
            Err(err) => return Ok(Err(err)),
        };
        self.save_unlocked(&next).await?;
        Ok(Ok(result))
    }

    async fn save_unlocked(&self, programs: &[Program]) -> anyhow::Result<()> {
        write_json_atomic(&self.primary, programs).await?;
        if let Err(err) = write_json_atomic(&self.cache, programs).await {
            warn!(path = %self.cache.display(), "failed to mirror catalog cache: {err:#}");
        }
        info!(programs = programs.len(), "catalog saved");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Subscribed(EmailAddress),
    AlreadySubscribed(EmailAddress),
}

impl SubscribeOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            SubscribeOutcome::Subscribed(_) => "subscribed",
            SubscribeOutcome::AlreadySubscribed(_) => "already_subscribed",
        }
    }

    pub fn email(&self) -> &EmailAddress {
        match self {
            SubscribeOutcome::Subscribed(email) | SubscribeOutcome::AlreadySubscribed(email) => email,
        }
    }
}

/// The set of notification addresses. Loaded once; every mutation rewrites
/// the whole file.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    path: PathBuf,
    emails: Mutex<Vec<String>>,
}

impl SubscriptionRegistry {
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let loaded = match read_json::<Vec<String>>(&path).await {
            Ok(Some(emails)) => emails,
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(path = %path.display(), "subscriptions unreadable, starting empty: {err:#}");
                Vec::new()
            }
        };
        let mut emails: Vec<String> = Vec::with_capacity(loaded.len());
        for email in loaded {
            if !emails.contains(&email) {
                emails.push(email);
            }
        }
        if let Err(err) = write_json_atomic(&path, &emails).await {
            warn!(path = %path.display(), "failed to initialize subscriptions file: {err:#}");
        }
        info!(subscribers = emails.len(), "subscription registry loaded");
        Self {
            path,
            emails: Mutex::new(emails),
        }
    }

    pub async fn subscribe(&self, raw: &str) -> Result<SubscribeOutcome, EmailError> {
        let email = EmailAddress::parse(raw)?;
        let mut emails = self.emails.lock().await;
        if emails.iter().any(|e| e == email.as_str()) {
            return Ok(SubscribeOutcome::AlreadySubscribed(email));
        }
        emails.push(email.as_str().to_string());
        if let Err(err) = write_json_atomic(&self.path, &*emails).await {
            warn!(path = %self.path.display(), "failed to persist subscriptions: {err:#}");
        }
        Ok(SubscribeOutcome::Subscribed(email))
    }

    pub async fn list(&self) -> Vec<String> {
        self.emails.lock().await.clone()
    }
}

/// Program ids already announced, keyed by subscriber address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SentLedger(BTreeMap<String, BTreeSet<u64>>);

impl SentLedger {
    pub fn was_sent(&self, email: &str, program_id: u64) -> bool {
        self.0.get(email).is_some_and(|ids| ids.contains(&program_id))
    }

    pub fn record(&mut self, email: &str, ids: impl IntoIterator<Item = u64>) {
        self.0.entry(email.to_string()).or_default().extend(ids);
    }

}

#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn load(&self) -> SentLedger {
        match read_json::<SentLedger>(&self.path).await {
            Ok(Some(ledger)) => ledger,
            Ok(None) => SentLedger::default(),
            Err(err) => {
                warn!(path = %self.path.display(), "sent-notification ledger unreadable, treating as empty: {err:#}");
                SentLedger::default()
            }
        }
    }

    pub async fn save(&self, ledger: &SentLedger) -> anyhow::Result<()> {
        write_json_atomic(&self.path, ledger).await
    }

    /// Creates an empty ledger file if none exists yet.
    pub async fn ensure_exists(&self) -> anyhow::Result<()> {
        if fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking {}", self.path.display()))?
        {
            return Ok(());
        }
        self.save(&SentLedger::default()).await
    }
}

#[derive(Debug, Clone)]
pub struct TriggerConfig {
    pub base_url: String,
    pub namespace: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

impl TriggerConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("KESTRA_BASE")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            namespace: std::env::var("KESTRA_NAMESPACE")
                .unwrap_or_else(|_| "opensource".to_string()),
            username: std::env::var("KESTRA_USERNAME").ok().filter(|v| !v.is_empty()),
            password: std::env::var("KESTRA_PASSWORD").ok(),
            timeout: Duration::from_secs(
                std::env::var("KESTRA_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            ),
        }
    }

    pub fn execution_url(&self, flow_id: &str) -> String {
        format!(
            "{}/api/v1/main/executions/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.namespace,
            flow_id
        )
    }
}

/// One workflow execution request: the flow to start and its text inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRequest {
    pub flow_id: String,
    pub inputs: Vec<(String, String)>,
}

impl TriggerRequest {
    pub fn new(flow_id: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            inputs: Vec::new(),
        }
    }

    pub fn input(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.push((key.into(), value.into()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.inputs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("workflow request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("workflow engine returned {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
}

impl TriggerError {
    /// Whether the next scheduled attempt has a fair chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            TriggerError::Request(err) => err.is_timeout() || err.is_connect(),
            TriggerError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
        }
    }
}

#[async_trait]
pub trait WorkflowTrigger: Send + Sync {
    async fn trigger(&self, request: &TriggerRequest) -> Result<(), TriggerError>;
}

/// Starts executions over HTTP, sending inputs as multipart form fields.
#[derive(Debug)]
pub struct HttpWorkflowTrigger {
    client: reqwest::Client,
    config: TriggerConfig,
}

impl HttpWorkflowTrigger {
    pub fn new(config: TriggerConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl WorkflowTrigger for HttpWorkflowTrigger {
    async fn trigger(&self, request: &TriggerRequest) -> Result<(), TriggerError> {
        let url = self.config.execution_url(&request.flow_id);
        let span = info_span!("workflow_trigger", flow_id = %request.flow_id, url = %url);

        async {
            let mut form = reqwest::multipart::Form::new();
            for (key, value) in &request.inputs {
                form = form.text(key.clone(), value.clone());
            }

            let mut req = self.client.post(&url).multipart(form);
            if let Some(username) = &self.config.username {
                req = req.basic_auth(username, self.config.password.as_deref());
            }

            let resp = req.send().await?;
            let status = resp.status();
            if status.is_success() {
                return Ok(());
            }
            let body = resp.text().await.unwrap_or_default();
            Err(TriggerError::HttpStatus {
                status: status.as_u16(),
                url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
