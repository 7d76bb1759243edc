//! Driver: glues client, supervisor, caches, storage and sessions together
//! and exposes the submission entry point.

mod request;

pub use request::{InputSpec, NodeOutputDetail, OutputSpec, Request, Response};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncRead;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::FileManager;
use crate::client::{Client, PromptEnvelope, WsSubscription};
use crate::config::DriverConfig;
use crate::error::{Error, Result};
use crate::session::{
    ArtifactSink, FilenameTemplate, ProgressInfo, Session, SessionConfig, SessionResult,
};
use crate::storage::{Bucket, Storage};
use crate::supervisor::{Supervisor, Thresholds};

/// Managed directories that always get a cache.
pub const SUB_DIR_INPUT: &str = "input";
pub const SUB_DIR_LORAS: &str = "models/loras";

const DEFAULT_CACHE_MB: u64 = 10240;
const OOM_MAX_RETRIES: u32 = 2;

/// Adapts a storage bucket to the session's artifact sink.
struct BucketSink {
    bucket: Arc<dyn Bucket>,
}

#[async_trait]
impl ArtifactSink for BucketSink {
    async fn put(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        path: &str,
        content_type: &str,
    ) -> Result<()> {
        self.bucket.put_stream(reader, path, content_type).await
    }
}

/// Submission driver bound to one backend.
pub struct Driver {
    config: DriverConfig,
    client: Arc<Client>,
    supervisor: Supervisor,
    storage: Arc<dyn Storage>,
    caches: HashMap<String, Arc<FileManager>>,
}

impl Driver {
    /// Build the driver: client, supervisor, and one file cache per managed
    /// directory (`input` and `models/loras` always included). Unless
    /// disabled, construction gates on the backend answering stats.
    pub async fn new(
        config: DriverConfig,
        storage: Arc<dyn Storage>,
        token: &CancellationToken,
    ) -> Result<Self> {
        let client = Arc::new(Client::new(config.client.clone())?);
        let supervisor = Supervisor::new(
            client.clone(),
            Thresholds {
                ram_free: config.ram_free_threshold,
                vram_free: config.vram_free_threshold,
                torch_vram_free: config.torch_vram_free_threshold,
            },
        );

        if !config.disable_health_check {
            supervisor.waiting_for_system_alive(token).await?;
        }

        let mut caches = HashMap::new();
        for dm in &config.dir_managers {
            let max_mb = if dm.max_mb > 0 {
                dm.max_mb
            } else {
                DEFAULT_CACHE_MB
            };
            caches.insert(
                dm.sub_dir.clone(),
                Arc::new(FileManager::new(
                    Path::new(&config.base_dir).join(&dm.sub_dir),
                    max_mb * 1024 * 1024,
                )?),
            );
        }
        for sub_dir in [SUB_DIR_INPUT, SUB_DIR_LORAS] {
            if !caches.contains_key(sub_dir) {
                caches.insert(
                    sub_dir.to_string(),
                    Arc::new(FileManager::new(
                        Path::new(&config.base_dir).join(sub_dir),
                        DEFAULT_CACHE_MB * 1024 * 1024,
                    )?),
                );
            }
        }

        Ok(Self {
            config,
            client,
            supervisor,
            storage,
            caches,
        })
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Submit one request and shepherd it to completion.
    pub async fn handle_prompt(
        &self,
        req: &Request,
        task_id: &str,
        client_id: &str,
        new_prompt_id: &str,
        progress_tx: Option<UnboundedSender<ProgressInfo>>,
    ) -> Result<Response> {
        let start = Utc::now();

        let workflow_raw = req
            .workflow
            .clone()
            .or_else(|| req.prompt.clone())
            .ok_or_else(|| Error::Validation("request carries no workflow".into()))?;
        let mut workflow = match workflow_raw {
            serde_json::Value::Object(map) => map,
            _ => return Err(Error::Validation("workflow is not an object".into())),
        };

        let sync_duration = self.sync_input_files(req).await?;

        // Trigger map: with node replacement on, only nodes actually rewritten
        // become triggers; otherwise every listed node does.
        let mut trigger_nodes: HashMap<String, String> = HashMap::new();
        if req.enable_node_replace {
            for output in &req.outputs {
                for node_id in output.replace_nodes(&mut workflow, !req.disable_metadata) {
                    trigger_nodes.insert(node_id, output.dir_path.clone());
                }
            }
        } else {
            for output in &req.outputs {
                for node_id in &output.node_ids {
                    trigger_nodes.insert(node_id.clone(), output.dir_path.clone());
                }
            }
        }

        let total_nodes = workflow.len();
        let client_id = if client_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            client_id.to_string()
        };

        // Two collectors per trigger node drain the session's channels into
        // the per-node output structs.
        let mut name_txs = HashMap::new();
        let mut text_txs = HashMap::new();
        let mut collectors: Vec<(String, String, JoinHandle<Vec<String>>, JoinHandle<Vec<String>>)> =
            Vec::new();
        for (node_id, dir) in &trigger_nodes {
            let (name_tx, mut name_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
            let (text_tx, mut text_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
            name_txs.insert(node_id.clone(), name_tx);
            text_txs.insert(node_id.clone(), text_tx);

            let files = tokio::spawn(async move {
                let mut collected = Vec::new();
                while let Some(name) = name_rx.recv().await {
                    collected.push(name);
                }
                collected
            });
            let texts = tokio::spawn(async move {
                let mut collected = Vec::new();
                while let Some(text) = text_rx.recv().await {
                    collected.push(text);
                }
                collected
            });
            collectors.push((node_id.clone(), dir.clone(), files, texts));
        }

        let sink = Arc::new(BucketSink {
            bucket: self.storage.bucket(&req.bucket),
        });
        let session = Arc::new(Session::new(
            SessionConfig {
                task_id: task_id.to_string(),
                client_id: client_id.clone(),
                prompt_id: new_prompt_id.to_string(),
                trigger_nodes,
                name_txs,
                text_txs,
                filename_tmpl: FilenameTemplate::default(),
                total_nodes,
                progress_tx,
                retry_times: self.config.retry_times,
            },
            self.client.clone(),
            sink,
        ));

        let subscription =
            WsSubscription::open(self.client.base_url(), &client_id, session.clone())?;

        let envelope = PromptEnvelope {
            prompt: serde_json::Value::Object(workflow),
            client_id: client_id.clone(),
            extra_data: req.extra_data.clone(),
        };
        let mut prompt_id = String::new();
        let mut submit_err = None;
        match self.client.queue_prompt(&envelope).await {
            Ok(resp) => {
                prompt_id = resp.prompt_id.clone();
                session.store_resp(&prompt_id, resp).await;
            }
            Err(e) => submit_err = Some(e),
        }

        // Drive to completion, then tear down in order: socket, channels,
        // collectors.
        let mut results = session.wait(self.config.max_timeout).await;
        subscription.close().await;
        session.close_outputs().await;
        let nodes_time = session.nodes_time().await;

        let mut outputs = Vec::new();
        for (node_id, dir_path, files, texts) in collectors {
            outputs.push(NodeOutputDetail {
                node_id,
                dir_path,
                files: files.await.unwrap_or_default(),
                texts: texts.await.unwrap_or_default(),
            });
        }

        if let Some(e) = submit_err {
            return Err(e);
        }
        let SessionResult { qp_resp, errors } = results.remove(&prompt_id).unwrap_or_default();
        if !errors.is_empty() {
            // hand back an OOM error when any part of the run hit one, so the
            // outer retry policy can see it
            let oom = errors.iter().position(Error::is_oom).unwrap_or(0);
            return Err(errors.into_iter().nth(oom).expect("non-empty errors"));
        }

        Ok(Response {
            qp_resp,
            outputs,
            start_time: start,
            end_time: Utc::now(),
            sync_duration,
            nodes_time,
            hostname: hostname(),
        })
    }

    /// Caller-assisted OOM policy: retry up to twice, the first time
    /// immediately, the second time after a reboot-and-wait.
    pub async fn handle_prompt_retry_on_oom(
        &self,
        token: &CancellationToken,
        req: &Request,
        task_id: &str,
        client_id: &str,
        progress_tx: Option<UnboundedSender<ProgressInfo>>,
    ) -> Result<Response> {
        for attempt in 0..=OOM_MAX_RETRIES {
            match self
                .handle_prompt(req, task_id, client_id, "", progress_tx.clone())
                .await
            {
                Err(e) if e.is_oom() && attempt < OOM_MAX_RETRIES => {
                    if attempt == 0 {
                        info!(
                            "task {task_id} is OOM (attempt {}/{}), retrying without reboot",
                            attempt + 1,
                            OOM_MAX_RETRIES + 1
                        );
                    } else {
                        info!(
                            "task {task_id} is OOM (attempt {}/{}), waiting for reboot",
                            attempt + 1,
                            OOM_MAX_RETRIES + 1
                        );
                        self.supervisor.waiting_for_reboot(token).await?;
                    }
                }
                other => return other,
            }
        }
        unreachable!()
    }

    /// Stage every requested input file through its directory cache,
    /// returning the accumulated staging time.
    async fn sync_input_files(&self, req: &Request) -> Result<Duration> {
        let mut cost = Duration::ZERO;
        if req.bucket.is_empty() {
            return Ok(cost);
        }

        for input in &req.inputs {
            let bucket_name = if input.bucket.is_empty() {
                req.bucket.as_str()
            } else {
                input.bucket.as_str()
            };
            let sync_to = if input.sync_to.is_empty() {
                SUB_DIR_INPUT
            } else {
                input.sync_to.trim_end_matches('/')
            };

            let cache = self.caches.get(sync_to).ok_or_else(|| {
                Error::Validation(format!("sync_to {sync_to:?} is not supported"))
            })?;
            let bucket = self.storage.bucket(bucket_name);

            if !input.files.is_empty() {
                info!(
                    "preparing {} input files from bucket {bucket_name} to {sync_to}",
                    input.files.len()
                );
            }

            let started = Instant::now();
            for (i, name) in input.files.iter().enumerate() {
                info!("syncing file {}/{}: {name}", i + 1, input.files.len());
                let bucket = bucket.clone();
                let object = name.clone();
                cache
                    .sync_file(name, move || {
                        let bucket = bucket.clone();
                        let object = object.clone();
                        async move { bucket.open(&object).await }
                    })
                    .await
                    .map_err(|e| {
                        warn!("sync {name} to {sync_to}: {e}");
                        e
                    })?;
            }
            cost += started.elapsed();
        }
        Ok(cost)
    }
}

fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DiskStorage;

    async fn test_driver(base_dir: &Path, storage_root: &Path) -> Driver {
        let config = DriverConfig {
            base_dir: base_dir.to_string_lossy().into_owned(),
            disable_health_check: true,
            ..Default::default()
        };
        let storage = Arc::new(DiskStorage::new(storage_root));
        Driver::new(config, storage, &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn construction_creates_the_mandatory_caches() {
        let base = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let driver = test_driver(base.path(), store.path()).await;

        assert!(driver.caches.contains_key(SUB_DIR_INPUT));
        assert!(driver.caches.contains_key(SUB_DIR_LORAS));
        assert!(base.path().join("input").is_dir());
        assert!(base.path().join("models/loras").is_dir());
    }

    #[tokio::test]
    async fn input_files_stage_through_the_cache() {
        let base = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(store.path().join("assets")).unwrap();
        std::fs::write(store.path().join("assets/pose.png"), b"pose").unwrap();

        let driver = test_driver(base.path(), store.path()).await;
        let req = Request {
            bucket: "assets".into(),
            inputs: vec![InputSpec {
                files: vec!["pose.png".into()],
                ..Default::default()
            }],
            ..Default::default()
        };

        driver.sync_input_files(&req).await.unwrap();
        assert_eq!(
            std::fs::read(base.path().join("input/pose.png")).unwrap(),
            b"pose"
        );
    }

    #[tokio::test]
    async fn unknown_sync_to_is_a_validation_error() {
        let base = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let driver = test_driver(base.path(), store.path()).await;

        let req = Request {
            bucket: "assets".into(),
            inputs: vec![InputSpec {
                files: vec!["x".into()],
                sync_to: "models/vae".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let err = driver.sync_input_files(&req).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn empty_request_bucket_skips_staging() {
        let base = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let driver = test_driver(base.path(), store.path()).await;

        let req = Request {
            inputs: vec![InputSpec {
                files: vec!["never-fetched".into()],
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(
            driver.sync_input_files(&req).await.unwrap(),
            Duration::ZERO
        );
    }
}
