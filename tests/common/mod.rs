#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use feed_reader::alerts::Alerter;
use feed_reader::config::{self, SourceConfig};
use feed_reader::messaging::{Envelope, MessagingService, SendError, SendResponse};
use feed_reader::model::RemoteFile;
use feed_reader::orchestrator::Runner;
use feed_reader::remote::RemoteSource;
use feed_reader::storage::{LocalStore, Staging};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex;

pub async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn example_source(id: &str) -> SourceConfig {
    let cfg: config::Config = serde_yaml::from_str(config::example()).unwrap();
    cfg.sources.into_iter().find(|s| s.id == id).unwrap()
}

pub fn tpp_source() -> SourceConfig {
    example_source("TPP001")
}

pub fn emis_source() -> SourceConfig {
    example_source("EMIS001")
}

/// In-memory drop-off recording every fetch.
#[derive(Clone, Default)]
pub struct FakeRemote {
    files: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    fetched: Arc<Mutex<Vec<String>>>,
    list_error: Arc<Mutex<Option<String>>>,
}

impl FakeRemote {
    pub async fn put(&self, name: &str, content: &str) {
        self.files
            .lock()
            .await
            .insert(name.to_string(), content.as_bytes().to_vec());
    }

    pub async fn remove(&self, name: &str) {
        self.files.lock().await.remove(name);
    }

    pub async fn fail_listing(&self, error: Option<&str>) {
        *self.list_error.lock().await = error.map(str::to_string);
    }

    pub async fn fetched(&self) -> Vec<String> {
        self.fetched.lock().await.clone()
    }
}

#[async_trait]
impl RemoteSource for FakeRemote {
    async fn list(&self) -> Result<Vec<RemoteFile>> {
        if let Some(err) = self.list_error.lock().await.clone() {
            return Err(anyhow!(err));
        }
        Ok(self
            .files
            .lock()
            .await
            .iter()
            .map(|(name, content)| RemoteFile {
                name: name.clone(),
                size: content.len() as u64,
                modified: None,
                path: format!("/outbound/{}", name),
            })
            .collect())
    }

    async fn fetch(&self, file: &RemoteFile, dest: &Path) -> Result<()> {
        let content = self
            .files
            .lock()
            .await
            .get(&file.name)
            .cloned()
            .ok_or_else(|| anyhow!("{} vanished", file.name))?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, content).await?;
        self.fetched.lock().await.push(file.name.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SentCall {
    pub organisation_id: String,
    pub message_id: String,
    pub is_bulk: bool,
    pub payload: Vec<u8>,
}

/// Accepts everything except organisations told to fail.
#[derive(Clone, Default)]
pub struct RecordingMessaging {
    failing: Arc<Mutex<BTreeMap<String, String>>>,
    calls: Arc<Mutex<Vec<SentCall>>>,
}

impl RecordingMessaging {
    pub async fn fail_for(&self, organisation: &str, body: &str) {
        self.failing
            .lock()
            .await
            .insert(organisation.to_string(), body.to_string());
    }

    pub async fn recover(&self, organisation: &str) {
        self.failing.lock().await.remove(organisation);
    }

    pub async fn calls(&self) -> Vec<SentCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl MessagingService for RecordingMessaging {
    async fn send(&self, envelope: &Envelope, is_bulk: bool) -> Result<SendResponse, SendError> {
        use base64::Engine;
        let payload = base64::engine::general_purpose::STANDARD
            .decode(&envelope.payload)
            .unwrap();
        self.calls.lock().await.push(SentCall {
            organisation_id: envelope.organisation_id.clone(),
            message_id: envelope.message_id.clone(),
            is_bulk,
            payload,
        });
        if let Some(body) = self.failing.lock().await.get(&envelope.organisation_id) {
            return Err(SendError::Http {
                status_line: "HTTP/1.1 503 Service Unavailable".into(),
                body: body.clone(),
            });
        }
        Ok(SendResponse {
            status_line: "HTTP/1.1 200 OK".into(),
            body: "{\"accepted\":true}".into(),
        })
    }
}

/// Records delivered alerts; while `down` every send fails.
#[derive(Clone, Default)]
pub struct RecordingAlerter {
    sent: Arc<Mutex<Vec<String>>>,
    down: Arc<Mutex<bool>>,
}

impl RecordingAlerter {
    pub async fn sent(&self) -> Vec<String> {
        self.sent.lock().await.clone()
    }

    pub async fn set_down(&self, down: bool) {
        *self.down.lock().await = down;
    }
}

#[async_trait]
impl Alerter for RecordingAlerter {
    async fn send(&self, text: &str) -> Result<()> {
        if *self.down.lock().await {
            return Err(anyhow!("alert channel unavailable"));
        }
        self.sent.lock().await.push(text.to_string());
        Ok(())
    }
}

pub struct TestEnv {
    pub dir: TempDir,
    pub runner: Runner,
    pub source: SourceConfig,
    pub remote: FakeRemote,
    pub messaging: RecordingMessaging,
    pub alerter: RecordingAlerter,
}

pub async fn tpp_env() -> TestEnv {
    env_for(tpp_source()).await
}

pub async fn emis_env() -> TestEnv {
    env_for(emis_source()).await
}

async fn env_for(source: SourceConfig) -> TestEnv {
    let dir = tempfile::tempdir().unwrap();
    let messaging = RecordingMessaging::default();
    let alerter = RecordingAlerter::default();
    let runner = Runner {
        pool: setup_pool().await,
        store: Arc::new(LocalStore::new(dir.path().join("storage"))),
        staging: Staging::new(dir.path().join("staging")),
        messaging: Arc::new(messaging.clone()),
        alerter: Arc::new(alerter.clone()),
        lock_wait: Duration::from_secs(1),
        lock_lease: Duration::from_secs(60),
    };
    TestEnv {
        dir,
        runner,
        source,
        remote: FakeRemote::default(),
        messaging,
        alerter,
    }
}

impl TestEnv {
    pub async fn run(&self) -> feed_reader::model::PollingAttempt {
        self.runner
            .run_source(&self.source, &self.remote)
            .await
            .unwrap()
    }
}

/// Drop one complete SystmOne delivery stamped `ts` (yyyyMMddHHmmss) with the
/// given (organisation, patient id) rows. Every organisation in `known_orgs`
/// is listed in SROrganisation.
pub async fn put_tpp_batch(
    remote: &FakeRemote,
    ts: &str,
    known_orgs: &[&str],
    patients: &[(&str, &str)],
) {
    put_tpp_manifest(remote, ts, false).await;
    put_tpp_organisations(remote, ts, known_orgs).await;
    put_tpp_patients(remote, ts, patients).await;
}

pub async fn put_tpp_manifest(remote: &FakeRemote, ts: &str, is_delta: bool) {
    let delta = if is_delta { "Y" } else { "N" };
    let date_to = format!("{}_{}", &ts[..8], &ts[8..12]);
    remote
        .put(
            &format!("SRManifest_{}.csv", ts),
            &format!(
                "FileName,IsDelta,IsReference,DateExtractFrom,DateExtractTo\n\
                 SRPatient,{delta},N,,{date_to}\n\
                 SROrganisation,{delta},Y,,{date_to}\n"
            ),
        )
        .await;
}

pub async fn put_tpp_organisations(remote: &FakeRemote, ts: &str, orgs: &[&str]) {
    let mut body = String::from("ID,Name\n");
    for org in orgs {
        body.push_str(&format!("{},Practice {}\n", org, org));
    }
    remote.put(&format!("SROrganisation_{}.csv", ts), &body).await;
}

pub async fn put_tpp_patients(remote: &FakeRemote, ts: &str, patients: &[(&str, &str)]) {
    let mut body = String::from("RowIdentifier,IDOrganisationVisibleTo,DateBirth\n");
    for (org, id) in patients {
        body.push_str(&format!("{},{},1980-01-01\n", id, org));
    }
    remote.put(&format!("SRPatient_{}.csv", ts), &body).await;
}

pub const EMIS_AGREEMENT: &str = "45E7CD20-EE37-41AB-90D6-DC9D4B03D102";

/// Drop one EMIS file, e.g. `file_type = "Admin_Patient"`, stamped `ts`.
pub async fn put_emis_file(remote: &FakeRemote, processing_id: u32, file_type: &str, ts: &str, body: &str) {
    remote
        .put(
            &format!("{}_{}_{}_{}.csv", processing_id, file_type, ts, EMIS_AGREEMENT),
            body,
        )
        .await;
}
