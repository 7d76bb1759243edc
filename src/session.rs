//! Per-submission session runtime.
//!
//! A session consumes the single ordered WebSocket frame stream of one
//! submission and produces per-node artifact names, per-node texts, per-node
//! durations, a progress stream, and a final error-or-success signal keyed by
//! prompt id. Frames are handled one at a time; an artifact save completes
//! before the next frame is consumed, so filename rewriting always reflects
//! the real storage name.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::{Client, FrameSink, QueuePromptResp, ViewPayload};
use crate::error::{BackendError, Error, Result};
use crate::protocol::{BinaryFrame, Event, ExecutingData, FileInfo};

/// Output keys routed to storage, covering the save-image, 3d, audio,
/// image-comparer and video-combine node families.
pub const SUPPORTED_OUTPUT_KEYS: [&str; 6] =
    ["images", "3d", "audio", "a_images", "b_images", "gifs"];

/// One progress tick emitted while nodes execute.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressInfo {
    pub node_id: String,
    pub percent_num: i64,
    pub hostname: String,
}

/// Variables available to the artifact filename template.
#[derive(Debug, Clone, Default)]
pub struct NameInfo {
    pub client_id: String,
    pub prompt_id: String,
    pub index: u32,
    /// Extension with the dot prefix, e.g. `.png`.
    pub ext: String,
    pub task_id: String,
    pub content_type: String,
}

/// Artifact filename template with `{Var}` placeholders.
#[derive(Debug, Clone)]
pub struct FilenameTemplate {
    raw: String,
}

impl FilenameTemplate {
    pub const DEFAULT: &'static str = "{PromptID}_{Index}{EXT}";

    /// An empty template string falls back to the default.
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if raw.is_empty() {
            return Self::default();
        }
        Self { raw }
    }

    pub fn render(&self, info: &NameInfo) -> String {
        self.raw
            .replace("{ClientID}", &info.client_id)
            .replace("{PromptID}", &info.prompt_id)
            .replace("{Index}", &info.index.to_string())
            .replace("{EXT}", &info.ext)
            .replace("{TaskID}", &info.task_id)
            .replace("{ContentType}", &info.content_type)
    }
}

impl Default for FilenameTemplate {
    fn default() -> Self {
        Self {
            raw: Self::DEFAULT.to_string(),
        }
    }
}

/// Fetches URL-referenced artifacts. Implemented by the HTTP client; stubbed
/// in tests.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn fetch(&self, file: &FileInfo) -> Result<ViewPayload>;
}

#[async_trait]
impl ArtifactSource for Client {
    async fn fetch(&self, file: &FileInfo) -> Result<ViewPayload> {
        self.get_view(file).await
    }
}

/// Destination of saved artifacts.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn put(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        path: &str,
        content_type: &str,
    ) -> Result<()>;
}

/// Final state of one prompt after [`Session::wait`].
#[derive(Debug, Default)]
pub struct SessionResult {
    pub qp_resp: QueuePromptResp,
    pub errors: Vec<Error>,
}

struct RespSlot {
    qp_resp: QueuePromptResp,
    tx: Option<UnboundedSender<Error>>,
    rx: Option<UnboundedReceiver<Error>>,
}

#[derive(Clone)]
struct RunningNode {
    prompt_id: String,
    node_id: String,
}

#[derive(Default)]
struct SessionState {
    resp: HashMap<String, RespSlot>,
    running_node: Option<RunningNode>,
    last_node: Option<(String, Instant)>,
    executed_nodes: Vec<String>,
    nodes_time: HashMap<String, Duration>,
}

/// Construction parameters for a [`Session`].
pub struct SessionConfig {
    pub task_id: String,
    pub client_id: String,
    /// Preferred prompt id, when the caller pre-assigned one.
    pub prompt_id: String,
    /// Node id to destination sub-directory; empty string means text-only.
    pub trigger_nodes: HashMap<String, String>,
    pub name_txs: HashMap<String, UnboundedSender<String>>,
    pub text_txs: HashMap<String, UnboundedSender<String>>,
    pub filename_tmpl: FilenameTemplate,
    pub total_nodes: usize,
    pub progress_tx: Option<UnboundedSender<ProgressInfo>>,
    pub retry_times: u32,
}

/// Per-submission event correlator and artifact router.
pub struct Session {
    task_id: String,
    client_id: String,
    prompt_id: String,
    trigger_nodes: HashMap<String, String>,
    name_txs: Mutex<HashMap<String, UnboundedSender<String>>>,
    text_txs: Mutex<HashMap<String, UnboundedSender<String>>>,
    filename_tmpl: FilenameTemplate,
    total_nodes: usize,
    progress_tx: Option<UnboundedSender<ProgressInfo>>,
    retry_times: u32,
    index: AtomicU32,
    state: Mutex<SessionState>,
    source: Arc<dyn ArtifactSource>,
    sink: Arc<dyn ArtifactSink>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        source: Arc<dyn ArtifactSource>,
        sink: Arc<dyn ArtifactSink>,
    ) -> Self {
        Self {
            task_id: config.task_id,
            client_id: config.client_id,
            prompt_id: config.prompt_id,
            trigger_nodes: config.trigger_nodes,
            name_txs: Mutex::new(config.name_txs),
            text_txs: Mutex::new(config.text_txs),
            filename_tmpl: config.filename_tmpl,
            total_nodes: config.total_nodes,
            progress_tx: config.progress_tx,
            retry_times: config.retry_times,
            index: AtomicU32::new(0),
            state: Mutex::new(SessionState::default()),
            source,
            sink,
        }
    }

    /// Register a submitted prompt so its events can be correlated.
    pub async fn store_resp(&self, prompt_id: &str, qp_resp: QueuePromptResp) {
        if !self.prompt_id.is_empty() && self.prompt_id != prompt_id {
            debug!(
                "preferred prompt id {} superseded by {prompt_id}",
                self.prompt_id
            );
        }
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.state.lock().await.resp.insert(
            prompt_id.to_string(),
            RespSlot {
                qp_resp,
                tx: Some(tx),
                rx: Some(rx),
            },
        );
    }

    /// Per-node durations accumulated so far.
    pub async fn nodes_time(&self) -> HashMap<String, Duration> {
        self.state.lock().await.nodes_time.clone()
    }

    /// Drop the per-node output channels so collectors can finish.
    pub async fn close_outputs(&self) {
        self.name_txs.lock().await.clear();
        self.text_txs.lock().await.clear();
    }

    /// Drain every stored prompt's error channel until it closes or the
    /// deadline elapses. A missed deadline yields the distinguished
    /// [`Error::Timeout`].
    pub async fn wait(&self, max_timeout: Duration) -> HashMap<String, SessionResult> {
        let deadline = tokio::time::Instant::now() + max_timeout;

        let pending: Vec<(String, QueuePromptResp, Option<UnboundedReceiver<Error>>)> = {
            let mut state = self.state.lock().await;
            state
                .resp
                .iter_mut()
                .map(|(id, slot)| (id.clone(), slot.qp_resp.clone(), slot.rx.take()))
                .collect()
        };

        let mut results = HashMap::new();
        for (prompt_id, qp_resp, rx) in pending {
            let mut errors = Vec::new();
            if let Some(mut rx) = rx {
                loop {
                    match tokio::time::timeout_at(deadline, rx.recv()).await {
                        Ok(Some(err)) => errors.push(err),
                        Ok(None) => break,
                        Err(_) => {
                            errors.push(Error::Timeout);
                            break;
                        }
                    }
                }
            }
            results.insert(prompt_id, SessionResult { qp_resp, errors });
        }
        results
    }

    /// Attach an error and/or the terminal marker to a prompt's channel.
    async fn handle_result(&self, prompt_id: &str, err: Option<Error>, is_final: bool) {
        let mut state = self.state.lock().await;
        if let Some(slot) = state.resp.get_mut(prompt_id) {
            if let Some(err) = err {
                if let Some(tx) = &slot.tx {
                    let _ = tx.send(err);
                }
            }
            if is_final {
                slot.tx = None;
                state.running_node = None;
            }
        }
    }

    async fn handle_executing(&self, data: ExecutingData) {
        let finished = {
            let mut state = self.state.lock().await;
            if let Some((node, since)) = state.last_node.take() {
                let elapsed = since.elapsed();
                *state.nodes_time.entry(node).or_default() += elapsed;
            }

            match data.node {
                Some(node) => {
                    state.last_node = Some((node.clone(), Instant::now()));
                    self.update_progress(&mut state, &data.prompt_id, std::slice::from_ref(&node));
                    None
                }
                None => Some(data.prompt_id),
            }
        };

        if let Some(prompt_id) = finished {
            // terminal event of the prompt
            self.handle_result(&prompt_id, None, true).await;
        }
    }

    fn update_progress(&self, state: &mut SessionState, prompt_id: &str, nodes: &[String]) {
        state.executed_nodes.extend_from_slice(nodes);
        let current = match nodes.last() {
            Some(node) => node.clone(),
            None => return,
        };
        state.running_node = Some(RunningNode {
            prompt_id: prompt_id.to_string(),
            node_id: current.clone(),
        });

        if let Some(tx) = &self.progress_tx {
            let mut percent =
                (state.executed_nodes.len() as f64 / self.total_nodes as f64 * 100.0) as i64;
            if percent >= 100 {
                percent = 99;
            }
            let _ = tx.send(ProgressInfo {
                node_id: current,
                percent_num: percent,
                hostname: String::new(),
            });
        }
    }

    async fn handle_executed(&self, mut data: crate::protocol::ExecutedData) {
        let Some(node) = data.executing.node.clone() else {
            return;
        };
        let Some(dir) = self.trigger_nodes.get(&node) else {
            return;
        };

        if let Some(content) = data.output.get("text") {
            self.handle_text(&node, content).await;
        }

        if dir.is_empty() {
            return;
        }
        for key in SUPPORTED_OUTPUT_KEYS {
            let Some(content) = data.output.get(key) else {
                continue;
            };
            match self
                .rewrite_file_info(&node, &data.executing.prompt_id, content)
                .await
            {
                Ok(rewritten) => {
                    data.output.insert(key.to_string(), rewritten);
                }
                Err(e) => error!("handle fileinfo: {e}"),
            }
        }
    }

    async fn handle_text(&self, node_id: &str, content: &Value) {
        let texts: Vec<String> = match serde_json::from_value(content.clone()) {
            Ok(texts) => texts,
            Err(e) => {
                warn!("texts unmarshal: {e}, skip");
                return;
            }
        };
        let txs = self.text_txs.lock().await;
        if let Some(tx) = txs.get(node_id) {
            for text in texts {
                let _ = tx.send(text);
            }
        }
    }

    /// Fetch every referenced file, save it under the node's directory and
    /// rewrite the reference to the storage-relative name. Fetch and save
    /// errors attach to the prompt without terminating the session.
    async fn rewrite_file_info(
        &self,
        node_id: &str,
        prompt_id: &str,
        content: &Value,
    ) -> Result<Value> {
        let mut files: Vec<FileInfo> = serde_json::from_value(content.clone())
            .map_err(|e| Error::Validation(format!("unmarshal images: {e}")))?;

        for file in &mut files {
            let mut info = NameInfo {
                client_id: self.client_id.clone(),
                prompt_id: prompt_id.to_string(),
                index: self.next_index(),
                ext: ext_of(&file.filename),
                task_id: self.task_id.clone(),
                content_type: String::new(),
            };

            let payload = match self.source.fetch(file).await {
                Ok(payload) => payload,
                Err(e) => {
                    self.handle_result(
                        prompt_id,
                        Some(Error::Validation(format!("get image: {e}"))),
                        false,
                    )
                    .await;
                    continue;
                }
            };
            info.content_type = payload.content_type.clone();

            let mut reader = payload.reader;
            match self.save(node_id, &info, &mut *reader).await {
                Ok(name) => {
                    if let Some(dir) = self.trigger_nodes.get(node_id) {
                        file.subfolder = dir.clone();
                    }
                    file.filename = name;
                }
                Err(e) => {
                    self.handle_result(
                        prompt_id,
                        Some(Error::Validation(format!("save: {e}"))),
                        false,
                    )
                    .await;
                }
            }
        }

        Ok(serde_json::to_value(files)?)
    }

    async fn handle_binary(&self, frame: &[u8]) {
        let running = match &self.state.lock().await.running_node {
            Some(running) => running.clone(),
            None => return,
        };

        let Some(dir) = self.trigger_nodes.get(&running.node_id) else {
            return;
        };
        if dir.is_empty() {
            return;
        }

        let decoded = match BinaryFrame::decode(frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("BIN message unmarshal: {e}, skip");
                self.handle_result(
                    &running.prompt_id,
                    Some(Error::Validation(format!("unmarshal binary: {e}"))),
                    false,
                )
                .await;
                return;
            }
        };

        debug!("ws trigger save on node #{}", running.node_id);
        let info = NameInfo {
            client_id: self.client_id.clone(),
            prompt_id: running.prompt_id.clone(),
            index: self.next_index(),
            ext: decoded.kind.ext().to_string(),
            task_id: self.task_id.clone(),
            content_type: decoded.kind.content_type().to_string(),
        };

        let mut reader = std::io::Cursor::new(decoded.blob);
        if let Err(e) = self.save(&running.node_id, &info, &mut reader).await {
            self.handle_result(
                &running.prompt_id,
                Some(Error::Validation(format!("save: {e}"))),
                false,
            )
            .await;
        }
    }

    fn next_index(&self) -> u32 {
        self.index.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn save(
        &self,
        node_id: &str,
        info: &NameInfo,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<String> {
        let name = self.filename_tmpl.render(info);
        info!(
            "trigger save on node #{node_id}, Content-Type: {:?}",
            info.content_type
        );
        self.save_stream(node_id, &name, reader, &info.content_type)
            .await?;
        Ok(name)
    }

    /// Stage the stream to a local temp file, then upload from the temp with
    /// retries, seeking back to the start between attempts.
    async fn save_stream(
        &self,
        node_id: &str,
        name: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        content_type: &str,
    ) -> Result<()> {
        let tmp_path = std::env::temp_dir().join(format!("artifact-upload-{}", Uuid::new_v4()));
        let mut tmp = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&tmp_path)
            .await?;

        let staged = async {
            tokio::io::copy(reader, &mut tmp).await?;
            tmp.flush().await?;
            Ok::<_, Error>(())
        }
        .await;
        if let Err(e) = staged {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }
        debug!("save {name} staged to {}", tmp_path.display());

        let dir = self.trigger_nodes.get(node_id).cloned().unwrap_or_default();
        let target = Path::new(&dir).join(name).to_string_lossy().into_owned();

        let retry_times = if self.retry_times == 0 {
            3
        } else {
            self.retry_times
        };

        let mut last_err = None;
        for attempt in 0..retry_times {
            if let Err(e) = tmp.seek(std::io::SeekFrom::Start(0)).await {
                last_err = Some(e.into());
                break;
            }
            match self.sink.put(&mut tmp, &target, content_type).await {
                Ok(()) => {
                    debug!("save {name} success");
                    let _ = tokio::fs::remove_file(&tmp_path).await;
                    self.push_name(node_id, name).await;
                    return Ok(());
                }
                Err(e) => {
                    warn!("save {name} failed, retry {attempt}: {e}");
                    last_err = Some(e);
                }
            }
        }

        let _ = tokio::fs::remove_file(&tmp_path).await;
        Err(last_err.unwrap_or_else(|| {
            Error::Validation(format!("save {name}: retried {retry_times} times"))
        }))
    }

    async fn push_name(&self, node_id: &str, name: &str) {
        let txs = self.name_txs.lock().await;
        if let Some(tx) = txs.get(node_id) {
            let _ = tx.send(name.to_string());
        }
    }

    async fn handle_event(&self, raw: &str) {
        let event = match Event::parse(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!("TXT message unmarshal: {e}, skip");
                return;
            }
        };

        match event {
            Event::Executing(data) => self.handle_executing(data).await,
            Event::ExecutionSuccess(data) => {
                // closure is driven by the null-node `executing` event
                self.handle_result(&data.prompt_id, None, false).await;
            }
            Event::ExecutionError(data) => {
                let err = BackendError {
                    message: raw.to_string(),
                    is_oom: data.is_oom(),
                    nodes_time: self.nodes_time().await,
                };
                self.handle_result(&data.interrupted.prompt_id, Some(err.into()), true)
                    .await;
            }
            Event::ExecutionInterrupted(data) => {
                let err = BackendError {
                    message: raw.to_string(),
                    is_oom: false,
                    nodes_time: self.nodes_time().await,
                };
                self.handle_result(&data.prompt_id, Some(err.into()), true)
                    .await;
            }
            Event::Executed(data) => self.handle_executed(data).await,
            Event::ExecutionCached(data) => {
                if data.nodes.is_empty() {
                    return;
                }
                let mut state = self.state.lock().await;
                for node in &data.nodes {
                    state.nodes_time.insert(node.clone(), Duration::ZERO);
                }
                self.update_progress(&mut state, &data.prompt_id, &data.nodes);
            }
            // queue broadcasts and per-node progress ticks are not consumed
            Event::Status(_) | Event::Progress(_) | Event::ExecutionStart(_) | Event::Other(_) => {}
        }
    }
}

#[async_trait]
impl FrameSink for Session {
    async fn on_text(&self, text: &str) {
        debug!("ws recv TXT: {text}");
        self.handle_event(text).await;
    }

    async fn on_binary(&self, frame: &[u8]) {
        debug!("ws recv BIN: {} bytes", frame.len());
        self.handle_binary(frame).await;
    }
}

fn ext_of(filename: &str) -> String {
    match Path::new(filename).extension().and_then(|e| e.to_str()) {
        Some(ext) => format!(".{ext}"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    struct StaticSource {
        files: HashMap<String, (Vec<u8>, String)>,
    }

    #[async_trait]
    impl ArtifactSource for StaticSource {
        async fn fetch(&self, file: &FileInfo) -> Result<ViewPayload> {
            let (bytes, content_type) = self
                .files
                .get(&file.filename)
                .cloned()
                .ok_or_else(|| Error::Validation(format!("no such file {}", file.filename)))?;
            Ok(ViewPayload {
                content_type,
                reader: Box::new(std::io::Cursor::new(bytes)),
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        puts: Mutex<Vec<(String, Vec<u8>, String)>>,
    }

    #[async_trait]
    impl ArtifactSink for RecordingSink {
        async fn put(
            &self,
            reader: &mut (dyn AsyncRead + Send + Unpin),
            path: &str,
            content_type: &str,
        ) -> Result<()> {
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes).await?;
            self.puts
                .lock()
                .await
                .push((path.to_string(), bytes, content_type.to_string()));
            Ok(())
        }
    }

    struct Harness {
        session: Arc<Session>,
        sink: Arc<RecordingSink>,
        name_rx: UnboundedReceiver<String>,
        progress_rx: UnboundedReceiver<ProgressInfo>,
    }

    fn harness(files: &[(&str, &[u8], &str)], total_nodes: usize) -> Harness {
        let source = Arc::new(StaticSource {
            files: files
                .iter()
                .map(|(name, bytes, ct)| (name.to_string(), (bytes.to_vec(), ct.to_string())))
                .collect(),
        });
        let sink = Arc::new(RecordingSink::default());

        let (name_tx, name_rx) = tokio::sync::mpsc::unbounded_channel();
        let (text_tx, _text_rx) = tokio::sync::mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = tokio::sync::mpsc::unbounded_channel();

        let session = Session::new(
            SessionConfig {
                task_id: "task-1".into(),
                client_id: "client-1".into(),
                prompt_id: String::new(),
                trigger_nodes: HashMap::from([("1".to_string(), "renders".to_string())]),
                name_txs: HashMap::from([("1".to_string(), name_tx)]),
                text_txs: HashMap::from([("1".to_string(), text_tx)]),
                filename_tmpl: FilenameTemplate::default(),
                total_nodes,
                progress_tx: Some(progress_tx),
                retry_times: 3,
            },
            source,
            sink.clone(),
        );

        Harness {
            session: Arc::new(session),
            sink,
            name_rx,
            progress_rx,
        }
    }

    #[tokio::test]
    async fn happy_path_saves_one_file_and_closes_clean() {
        let mut h = harness(&[("x.png", b"pngbytes", "image/png")], 2);
        h.session
            .store_resp(
                "p1",
                QueuePromptResp {
                    prompt_id: "p1".into(),
                    number: 1,
                    node_errors: None,
                },
            )
            .await;

        h.session
            .on_text(r#"{"type":"executing","data":{"prompt_id":"p1","node":"1"}}"#)
            .await;
        h.session
            .on_text(
                r#"{"type":"executed","data":{"prompt_id":"p1","node":"1","output":{"images":[{"filename":"x.png","subfolder":"","type":"output"}]}}}"#,
            )
            .await;
        h.session
            .on_text(r#"{"type":"executing","data":{"prompt_id":"p1","node":null}}"#)
            .await;

        let results = h.session.wait(Duration::from_millis(200)).await;
        let result = &results["p1"];
        assert!(result.errors.is_empty(), "errors: {:?}", result.errors);
        assert_eq!(result.qp_resp.prompt_id, "p1");

        let puts = h.sink.puts.lock().await;
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].0, "renders/p1_1.png");
        assert_eq!(puts[0].1, b"pngbytes");
        assert_eq!(puts[0].2, "image/png");
        drop(puts);

        assert_eq!(h.name_rx.recv().await.unwrap(), "p1_1.png");
    }

    #[tokio::test]
    async fn execution_error_carries_the_oom_flag() {
        let h = harness(&[], 1);
        h.session.store_resp("p1", QueuePromptResp::default()).await;

        h.session
            .on_text(
                r#"{"type":"execution_error","data":{"prompt_id":"p1","exception_type":"torch.OutOfMemoryError","exception_message":"CUDA out of memory"}}"#,
            )
            .await;

        let results = h.session.wait(Duration::from_millis(200)).await;
        let errors = &results["p1"].errors;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_oom());
    }

    #[tokio::test]
    async fn interrupt_records_a_backend_error_without_oom() {
        let h = harness(&[], 1);
        h.session.store_resp("p1", QueuePromptResp::default()).await;

        h.session
            .on_text(
                r#"{"type":"execution_interrupted","data":{"prompt_id":"p1","node_id":"4","node_type":"KSampler","executed":["1"]}}"#,
            )
            .await;

        let results = h.session.wait(Duration::from_millis(200)).await;
        let errors = &results["p1"].errors;
        assert_eq!(errors.len(), 1);
        assert!(!errors[0].is_oom());
        assert!(matches!(errors[0], Error::Backend(_)));
    }

    #[tokio::test]
    async fn missed_deadline_yields_the_timeout_error() {
        let h = harness(&[], 1);
        h.session.store_resp("p1", QueuePromptResp::default()).await;

        let results = h.session.wait(Duration::from_millis(50)).await;
        assert!(matches!(results["p1"].errors[0], Error::Timeout));
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_capped() {
        let mut h = harness(&[], 3);
        h.session.store_resp("p1", QueuePromptResp::default()).await;

        for node in ["1", "2", "3", "3"] {
            let frame = format!(r#"{{"type":"executing","data":{{"prompt_id":"p1","node":"{node}"}}}}"#);
            h.session.on_text(&frame).await;
        }
        h.session
            .on_text(r#"{"type":"executing","data":{"prompt_id":"p1","node":null}}"#)
            .await;

        let mut last = 0;
        let mut seen = Vec::new();
        while let Ok(tick) = h.progress_rx.try_recv() {
            assert!(tick.percent_num >= last);
            assert!(tick.percent_num <= 99);
            last = tick.percent_num;
            seen.push(tick.percent_num);
        }
        assert_eq!(seen, [33, 66, 99, 99]);
    }

    #[tokio::test]
    async fn cached_nodes_get_zero_durations() {
        let h = harness(&[], 4);
        h.session.store_resp("p1", QueuePromptResp::default()).await;

        h.session
            .on_text(
                r#"{"type":"execution_cached","data":{"prompt_id":"p1","nodes":["2","3"]}}"#,
            )
            .await;

        let times = h.session.nodes_time().await;
        assert_eq!(times["2"], Duration::ZERO);
        assert_eq!(times["3"], Duration::ZERO);
    }

    #[tokio::test]
    async fn binary_preview_saves_into_the_running_node_dir() {
        let mut h = harness(&[], 1);
        h.session.store_resp("p1", QueuePromptResp::default()).await;

        h.session
            .on_text(r#"{"type":"executing","data":{"prompt_id":"p1","node":"1"}}"#)
            .await;

        let mut frame = Vec::new();
        frame.extend_from_slice(&1u32.to_be_bytes());
        frame.extend_from_slice(&2u32.to_be_bytes());
        frame.extend_from_slice(b"preview");
        h.session.on_binary(&frame).await;

        let puts = h.sink.puts.lock().await;
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].0, "renders/p1_1.png");
        assert_eq!(puts[0].1, b"preview");
        assert_eq!(puts[0].2, "image/png");
        drop(puts);

        assert_eq!(h.name_rx.recv().await.unwrap(), "p1_1.png");
    }

    #[tokio::test]
    async fn binary_frame_without_running_node_is_dropped() {
        let h = harness(&[], 1);
        let mut frame = Vec::new();
        frame.extend_from_slice(&1u32.to_be_bytes());
        frame.extend_from_slice(&2u32.to_be_bytes());
        h.session.on_binary(&frame).await;
        assert!(h.sink.puts.lock().await.is_empty());
    }

    #[tokio::test]
    async fn fetch_failure_attaches_error_but_keeps_session_alive() {
        let h = harness(&[], 2);
        h.session.store_resp("p1", QueuePromptResp::default()).await;

        h.session
            .on_text(r#"{"type":"executing","data":{"prompt_id":"p1","node":"1"}}"#)
            .await;
        // missing.png is not known to the source
        h.session
            .on_text(
                r#"{"type":"executed","data":{"prompt_id":"p1","node":"1","output":{"images":[{"filename":"missing.png","subfolder":"","type":"output"}]}}}"#,
            )
            .await;
        h.session
            .on_text(r#"{"type":"executing","data":{"prompt_id":"p1","node":null}}"#)
            .await;

        let results = h.session.wait(Duration::from_millis(200)).await;
        let errors = &results["p1"].errors;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("get image"));
    }

    #[test]
    fn filename_template_renders_all_variables() {
        let tmpl = FilenameTemplate::new("{TaskID}/{ClientID}_{PromptID}_{Index}{EXT}");
        let name = tmpl.render(&NameInfo {
            client_id: "c".into(),
            prompt_id: "p".into(),
            index: 7,
            ext: ".png".into(),
            task_id: "t".into(),
            content_type: "image/png".into(),
        });
        assert_eq!(name, "t/c_p_7.png");

        assert_eq!(FilenameTemplate::new("").render(&NameInfo::default()), "_0");
    }
}
