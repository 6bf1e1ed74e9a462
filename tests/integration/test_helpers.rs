//! Shared fixtures: stub collaborators, a channel-backed test client, and a
//! fully wired hub + runner harness driving a real child process.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use webtty::assets::{AssetProvider, DiffResult};
use webtty::install::DependencyInstaller;
use webtty::runner::python::PythonLocator;
use webtty::runner::{spawn_poll_loop, Runner};
use webtty::session::{ClientHandle, SessionHub, SessionState};
use webtty::Result;

pub const SETTLE: Duration = Duration::from_millis(20);
pub const CLOSE_GRACE: Duration = Duration::from_millis(30);
pub const POLL: Duration = Duration::from_millis(10);
const WAIT_LIMIT: Duration = Duration::from_secs(10);

// ── Stub collaborators ──────────────────────────────────────────────────────

/// Asset provider answering from canned values and counting calls.
pub struct StubAssets {
    succeed: bool,
    diff: DiffResult,
    pub request_calls: AtomicUsize,
    pub diff_calls: AtomicUsize,
}

impl StubAssets {
    pub fn ok() -> Arc<Self> {
        Self::with_diff(DiffResult::NoOp)
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            succeed: false,
            diff: DiffResult::NoOp,
            request_calls: AtomicUsize::new(0),
            diff_calls: AtomicUsize::new(0),
        })
    }

    pub fn with_diff(diff: DiffResult) -> Arc<Self> {
        Arc::new(Self {
            succeed: true,
            diff,
            request_calls: AtomicUsize::new(0),
            diff_calls: AtomicUsize::new(0),
        })
    }
}

impl AssetProvider for StubAssets {
    fn request_assets<'a>(
        &'a self,
        _descriptor: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            self.request_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.succeed)
        })
    }

    fn diff_assets(&self) -> Pin<Box<dyn Future<Output = DiffResult> + Send + '_>> {
        Box::pin(async move {
            self.diff_calls.fetch_add(1, Ordering::SeqCst);
            self.diff.clone()
        })
    }
}

/// Installer recording every call and emitting one progress line.
pub struct RecordingInstaller {
    succeed: bool,
    pub calls: std::sync::Mutex<Vec<(String, String)>>,
}

impl RecordingInstaller {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            succeed: true,
            calls: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            succeed: false,
            calls: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn recorded(&self) -> Vec<(String, String)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl DependencyInstaller for RecordingInstaller {
    fn install<'a>(
        &'a self,
        interpreter: &'a str,
        package: &'a str,
        progress: mpsc::Sender<String>,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            self.calls
                .lock()
                .expect("calls lock")
                .push((interpreter.to_owned(), package.to_owned()));
            let _ = progress.send(format!("Collecting {package}")).await;
            Ok(self.succeed)
        })
    }
}

// ── Test client ─────────────────────────────────────────────────────────────

/// A decoded wire frame: tag character plus its (un-base64ed) payload.
#[derive(Debug)]
pub struct Frame {
    pub tag: char,
    pub payload: String,
}

/// Channel-backed stand-in for one WebSocket connection.
pub struct TestClient {
    pub handle: ClientHandle,
    rx: mpsc::UnboundedReceiver<String>,
}

impl TestClient {
    pub fn new(id: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ClientHandle::new(id, tx, CancellationToken::new());
        Self { handle, rx }
    }

    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    pub fn is_closed(&self) -> bool {
        self.handle.cancel_token().is_cancelled()
    }

    /// Next raw frame, decoded. Raw (non-base64) payloads pass through.
    pub async fn next_frame(&mut self) -> Frame {
        let raw = tokio::time::timeout(WAIT_LIMIT, self.rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("outbound channel dropped");
        decode_frame(&raw)
    }

    /// Skip frames until a control frame with the given `Type` arrives,
    /// returning its parsed body.
    pub async fn wait_for_control(&mut self, com_type: &str) -> serde_json::Value {
        loop {
            let frame = self.next_frame().await;
            if frame.tag != 'C' {
                continue;
            }
            let body: serde_json::Value =
                serde_json::from_str(&frame.payload).expect("control body must be JSON");
            if body["Type"] == com_type {
                return body;
            }
        }
    }

    /// Assert no frame arrives within `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(Some(raw)) = tokio::time::timeout(window, self.rx.recv()).await {
            panic!("expected silence, got frame {raw:?}");
        }
    }

    /// Accumulate output-frame payloads until `needle` appears.
    pub async fn collect_output(&mut self, needle: &str) -> String {
        let mut acc = String::new();
        loop {
            let frame = self.next_frame().await;
            if frame.tag == 'O' {
                acc.push_str(&frame.payload);
                if acc.contains(needle) {
                    return acc;
                }
            }
        }
    }
}

pub fn decode_frame(raw: &str) -> Frame {
    let tag = raw.chars().next().expect("frame must carry a tag");
    let rest = &raw[tag.len_utf8()..];
    let payload = BASE64.decode(rest).map_or_else(
        |_| rest.to_owned(),
        |bytes| String::from_utf8_lossy(&bytes).into_owned(),
    );
    Frame { tag, payload }
}

// ── Session driving ─────────────────────────────────────────────────────────

/// Send a code submission control frame from `client`.
pub async fn submit(hub: &SessionHub, client: &ClientHandle, project_id: &str, code: &str) {
    let body = serde_json::json!({ "projectId": project_id, "xml": code }).to_string();
    hub.receive_frame(client.id(), &format!("C{body}")).await;
}

/// Poll the hub until it reaches `expected`, panicking on timeout.
pub async fn wait_for_state(hub: &SessionHub, expected: SessionState) {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    loop {
        if hub.state().await == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session never reached {expected:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll an arbitrary condition, panicking on timeout.
pub async fn wait_until<F>(what: &str, mut cond: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out: {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ── Full harness ────────────────────────────────────────────────────────────

/// Hub wired to a runner whose "interpreter" is `sh`, so submissions are
/// shell scripts and no Python install is required on the test host.
pub struct Harness {
    pub hub: SessionHub,
    pub runner: Arc<Runner>,
    pub assets: Arc<StubAssets>,
    pub installer: Arc<RecordingInstaller>,
    pub cancel: CancellationToken,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub fn start(assets: Arc<StubAssets>, installer: Arc<RecordingInstaller>) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let hub = SessionHub::new(Arc::clone(&assets) as Arc<dyn AssetProvider>, SETTLE, CLOSE_GRACE);
        let locator = PythonLocator::new(Some("sh".into()), dir.path().join("state.json"));
        let runner = Arc::new(Runner::new(
            Arc::new(hub.clone()),
            locator,
            Arc::clone(&installer) as Arc<dyn DependencyInstaller>,
            dir.path().join("asset"),
        ));
        let cancel = CancellationToken::new();
        let _loop = spawn_poll_loop(Arc::clone(&runner), POLL, cancel.clone());
        Self {
            hub,
            runner,
            assets,
            installer,
            cancel,
            _dir: dir,
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
