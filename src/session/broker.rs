//! Session broker: single source of truth for session readiness and
//! connection identity.
//!
//! All mutable session state lives behind one [`Mutex`], so every message
//! handler, timer callback, and stream-completion callback runs as a
//! serialized critical section — the session behaves as a single-writer
//! actor. Arbitration races (a new connection displacing a stale one, input
//! arriving before a process exists, a process crashing mid-stream) are
//! resolved here, keeping exactly-once execution semantics per submission.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::assets::{AssetProvider, AssetState};
use crate::frame::{self, FrameTag};
use crate::runner::RunnerSink;
use crate::session::control::{parse_control, ControlMessage, ControlRequest};
use crate::session::input::{InputBuffer, ERASE_NARROW, ERASE_WIDE};
use crate::session::{ClientHandle, SessionState};

/// Notice sent to a primary connection displaced by a newer one.
pub const DISPLACED_NOTICE: &str = "\r\n\r\nnew connection established, disconnecting";

/// Notice sent when the client explicitly tears the session down.
pub const CLOSED_NOTICE: &str = "connection terminated";

/// Notice appended after a completed run.
pub const RUN_COMPLETE_NOTICE: &str = "\r\n\r\nprogram finished";

/// Ticks of the asset wait loop before the one-shot "still loading" notice.
const LOAD_NOTICE_TICKS: u32 = 100;

/// Asset wait loop tick interval.
const ASSET_POLL: Duration = Duration::from_millis(5);

/// Handler invoked once a link connection is admitted on its route.
pub type RouteHandler =
    Arc<dyn Fn(SessionHub) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

fn banner_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"Running on (\S+)").unwrap()
    })
}

/// Mutable broker state; every access goes through [`SessionHub`]'s lock.
struct BrokerState {
    state: SessionState,
    enabled: bool,
    code: Option<String>,
    work_key: Option<String>,
    first_msg: Option<String>,
    primary: Option<ClientHandle>,
    input: InputBuffer,
    wait_to_close: bool,
    routes: HashMap<String, RouteHandler>,
    link: Option<ClientHandle>,
    next_link: Option<ClientHandle>,
    link_lock: bool,
    link_closed: bool,
    link_messages: VecDeque<String>,
    readiness: HashMap<String, AssetState>,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            state: SessionState::Wait,
            enabled: true,
            code: None,
            work_key: None,
            first_msg: None,
            primary: None,
            input: InputBuffer::new(),
            wait_to_close: false,
            routes: HashMap::new(),
            link: None,
            next_link: None,
            link_lock: false,
            link_closed: true,
            link_messages: VecDeque::new(),
            readiness: HashMap::new(),
        }
    }

    /// Recompute the readiness invariant: READY iff code, work key, enabled
    /// flag, and a primary connection are simultaneously present.
    fn recompute_state(&mut self) -> SessionState {
        self.state = if self.code.is_some()
            && self.work_key.is_some()
            && self.enabled
            && self.primary.is_some()
        {
            SessionState::Ready
        } else {
            SessionState::Wait
        };
        self.state
    }

    fn is_primary(&self, client_id: u64) -> bool {
        self.primary.as_ref().is_some_and(|c| c.id() == client_id)
    }

    fn active(&mut self) -> bool {
        self.recompute_state() == SessionState::Ready || self.wait_to_close
    }

    fn to_wait(&mut self) {
        self.state = SessionState::Wait;
        self.code = None;
        self.work_key = None;
    }

    /// Send an outward frame (base64-wrapped) to the primary connection.
    fn send_to_web(&self, tag: FrameTag, msg: &str) {
        if let Some(primary) = &self.primary {
            primary.send(frame::encode_outward(tag, msg));
        }
    }

    /// Send a `{Type, Info}` control frame to the primary connection.
    fn form_msg(&self, com_type: &str, info: &str) {
        if let Some(primary) = &self.primary {
            Self::form_msg_to(primary, com_type, info);
        }
    }

    /// Send a `{Type, Info}` control frame to an explicit connection.
    fn form_msg_to(client: &ClientHandle, com_type: &str, info: &str) {
        let body = serde_json::json!({ "Type": com_type, "Info": info }).to_string();
        client.send(frame::encode_outward(FrameTag::Control, &body));
    }
}

/// Cloneable handle to the single session's broker.
///
/// Owns the session, the per-route link-connection table, and the per-project
/// asset readiness map — the explicit per-server context that replaces any
/// process-wide registry.
#[derive(Clone)]
pub struct SessionHub {
    state: Arc<Mutex<BrokerState>>,
    assets: Arc<dyn AssetProvider>,
    settle: Duration,
    close_grace: Duration,
}

impl SessionHub {
    /// Create the hub for one server process.
    #[must_use]
    pub fn new(assets: Arc<dyn AssetProvider>, settle: Duration, close_grace: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::new())),
            assets,
            settle,
            close_grace,
        }
    }

    /// Register a link route; connections to unregistered routes are refused.
    pub async fn register_route(&self, route: &str, handler: RouteHandler) {
        self.state
            .lock()
            .await
            .routes
            .insert(route.to_owned(), handler);
    }

    // ── Connection arbitration ──────────────────────────────────────────────

    /// Attach a primary connection, displacing any existing one.
    ///
    /// The displaced connection receives a `compileFail` notice and is force
    /// closed before the newcomer is installed, so at no instant are two
    /// connections both treated as primary.
    pub async fn attach_primary(&self, client: ClientHandle) {
        let mut st = self.state.lock().await;
        if let Some(old) = st.primary.take() {
            info!(
                old_id = old.id(),
                new_id = client.id(),
                "primary displaced by new connection"
            );
            st.enabled = false;
            BrokerState::form_msg_to(&old, "compileFail", DISPLACED_NOTICE);
            old.close();
        } else {
            st.enabled = true;
        }
        st.first_msg = None;
        st.primary = Some(client);
    }

    /// Detach a primary connection; ignored unless it is the current one.
    pub async fn detach_primary(&self, client_id: u64) {
        let mut st = self.state.lock().await;
        if st.is_primary(client_id) {
            debug!(client_id, "primary detached, session to WAIT");
            st.primary = None;
            st.to_wait();
        }
    }

    /// Attach a link connection on `route`.
    ///
    /// Unregistered routes are refused outright. When another connection
    /// already owns the route, a settle window locks further displacement,
    /// closes the old connection, and only then admits the newcomer; a newer
    /// candidate arriving meanwhile wins instead. After admission the
    /// registered route handler runs on its own task.
    pub async fn attach_link(&self, route: &str, client: ClientHandle) {
        {
            let mut st = self.state.lock().await;
            if !st.routes.contains_key(route) {
                debug!(route, client_id = client.id(), "unknown link route refused");
                client.close();
                return;
            }
            st.next_link = Some(client.clone());
        }

        let needs_settle = {
            let mut st = self.state.lock().await;
            if st.link.is_some() && !st.link_lock {
                st.link_lock = true;
                st.link_closed = true;
                true
            } else {
                false
            }
        };

        if needs_settle {
            tokio::time::sleep(self.settle).await;
            let mut st = self.state.lock().await;
            st.link_lock = false;
            if let Some(old) = st.link.take() {
                debug!(route, old_id = old.id(), "stale link connection displaced");
                old.close();
            }
        }

        let handler = {
            let mut st = self.state.lock().await;
            let newest = st.next_link.as_ref().is_some_and(|c| c.id() == client.id());
            if !newest || st.link.is_some() {
                // A newer candidate claimed the route while we settled.
                client.close();
                return;
            }
            st.next_link = None;
            st.link = Some(client);
            st.link_closed = false;
            st.routes.get(route).cloned()
        };

        if let Some(handler) = handler {
            let hub = self.clone();
            tokio::spawn(handler(hub));
        }
    }

    /// Detach a link connection, with the same locked teardown used for
    /// displacement so a racing replacement is not torn down with it.
    pub async fn detach_link(&self, client_id: u64) {
        {
            let mut st = self.state.lock().await;
            let is_current = st.link.as_ref().is_some_and(|c| c.id() == client_id);
            if !is_current {
                return;
            }
            st.link_closed = true;
            st.link_lock = true;
        }
        tokio::time::sleep(self.settle).await;
        let mut st = self.state.lock().await;
        st.link_lock = false;
        if st.link.as_ref().is_some_and(|c| c.id() == client_id) {
            if let Some(old) = st.link.take() {
                old.close();
            }
        }
    }

    // ── Frame dispatch ──────────────────────────────────────────────────────

    /// Dispatch one raw message from the primary connection.
    ///
    /// Malformed frames are dropped after logging; a leading untagged JSON
    /// message is captured once per connection as opaque session info.
    pub async fn receive_frame(&self, client_id: u64, raw: &str) {
        match frame::decode(raw) {
            Ok((FrameTag::Control, payload)) => self.receive_control(client_id, payload).await,
            Ok((FrameTag::Input, payload)) => self.receive_input(client_id, payload).await,
            Ok((FrameTag::Output, _)) => {
                debug!(client_id, "dropping inbound frame with outward tag");
            }
            Err(err) => {
                if !self.capture_first_message(client_id, raw).await {
                    debug!(client_id, %err, "dropping malformed frame");
                }
            }
        }
    }

    async fn capture_first_message(&self, client_id: u64, raw: &str) -> bool {
        let mut st = self.state.lock().await;
        if !st.is_primary(client_id) || st.first_msg.is_some() {
            return false;
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) {
            if value.get("cookies").is_some() {
                debug!(client_id, "captured client session info");
            }
            st.first_msg = Some(raw.to_owned());
            return true;
        }
        false
    }

    /// Handle a control-frame payload.
    pub async fn receive_control(&self, client_id: u64, payload: &str) {
        let request = match parse_control(payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(client_id, %err, "dropping malformed control frame");
                return;
            }
        };

        match request {
            ControlRequest::Assets(msg) => {
                let hub = self.clone();
                tokio::spawn(async move {
                    hub.handle_assets(&msg).await;
                });
            }
            ControlRequest::CloseSession => self.close_session().await,
            ControlRequest::Submission(msg) => {
                let from_primary = {
                    let mut st = self.state.lock().await;
                    if st.is_primary(client_id) {
                        st.work_key.clone_from(&msg.project_id);
                        true
                    } else {
                        false
                    }
                };
                if from_primary {
                    let hub = self.clone();
                    tokio::spawn(async move {
                        hub.wait_for_assets(msg, client_id).await;
                    });
                }
            }
            ControlRequest::Ignored => {}
        }
    }

    /// Explicit client-initiated teardown: WAIT immediately, then after the
    /// grace delay run the asset diff (if the session had been READY), notify
    /// the client, close the primary, and re-arm the enabled flag.
    async fn close_session(&self) {
        let prev = {
            let mut st = self.state.lock().await;
            st.wait_to_close = true;
            let prev = st.recompute_state();
            st.to_wait();
            prev
        };

        let hub = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(hub.close_grace).await;
            let diff = if prev == SessionState::Ready {
                Some(hub.assets.diff_assets().await)
            } else {
                None
            };
            let mut st = hub.state.lock().await;
            st.wait_to_close = false;
            if let Some(diff) = diff {
                Self::send_diff_signal(&st, &diff);
            }
            st.form_msg("compileFail", CLOSED_NOTICE);
            if let Some(primary) = &st.primary {
                primary.close();
            }
            st.enabled = true;
        });
    }

    /// Handle an input-frame payload: line assembly with server-driven echo.
    ///
    /// Only honored while READY and only from the current primary connection.
    pub async fn receive_input(&self, client_id: u64, payload: &str) {
        let mut st = self.state.lock().await;
        if st.recompute_state() != SessionState::Ready || !st.is_primary(client_id) {
            return;
        }

        if payload == "\r" || payload == "\n" {
            st.input.flush_line();
            st.send_to_web(FrameTag::Input, "\r\n");
        } else if payload == "\u{7f}" {
            if let Some(removed) = st.input.backspace() {
                let marker = if crate::session::input::is_wide(removed) {
                    ERASE_WIDE
                } else {
                    ERASE_NARROW
                };
                if let Some(primary) = &st.primary {
                    primary.send(frame::encode_raw(FrameTag::Input, marker));
                }
            }
        } else {
            st.input.push_chars(payload);
            st.send_to_web(FrameTag::Input, payload);
        }
    }

    /// Buffer one raw message arriving on the active link connection.
    pub async fn receive_link_message(&self, client_id: u64, raw: &str) {
        let mut st = self.state.lock().await;
        if st.link.as_ref().is_some_and(|c| c.id() == client_id) {
            st.link_messages.push_back(raw.to_owned());
        }
    }

    /// Deliver a raw message to the active link connection, if open.
    pub async fn link_send(&self, message: &str) {
        let st = self.state.lock().await;
        if !st.link_closed {
            if let Some(link) = &st.link {
                link.send(message.to_owned());
            }
        }
    }

    /// Drain the oldest buffered link message, if the link is open.
    pub async fn link_receive(&self) -> Option<String> {
        let mut st = self.state.lock().await;
        if st.link_closed {
            return None;
        }
        st.link_messages.pop_front()
    }

    // ── Session state ───────────────────────────────────────────────────────

    /// Current session state, lazily recomputed from the readiness invariant.
    pub async fn state(&self) -> SessionState {
        self.state.lock().await.recompute_state()
    }

    /// Pop the oldest completed input line, if any.
    pub async fn fetch_next_input(&self) -> Option<String> {
        self.state.lock().await.input.pop_line()
    }

    /// The code payload and working-directory key, once both are present.
    pub async fn code_and_work_key(&self) -> Option<(String, String)> {
        let st = self.state.lock().await;
        match (&st.code, &st.work_key) {
            (Some(code), Some(key)) => Some((code.clone(), key.clone())),
            _ => None,
        }
    }

    /// Re-arm the enabled flag (called by the runner on every WAIT tick).
    pub async fn mark_idle(&self) {
        self.state.lock().await.enabled = true;
    }

    // ── Outward traffic from the runner ─────────────────────────────────────

    /// Forward a chunk of program output to the client.
    ///
    /// Only emits while READY or during the explicit-close grace period.
    /// Newlines are normalized for terminal display, stderr chunks are tagged
    /// distinctly, and a recognizable "server started" banner surfaces a
    /// derived signal frame with the discovered host.
    pub async fn send_output(&self, chunk: &str, is_err: bool) {
        let mut st = self.state.lock().await;
        if !st.active() {
            return;
        }

        let normalized = chunk.replace('\n', "\r\n");
        let output = if is_err {
            format!("[stderr] {normalized}")
        } else {
            normalized
        };
        st.send_to_web(FrameTag::Output, &output);

        if output.contains(" * Running on") {
            if let Some(captured) = banner_regex().captures(&output).and_then(|c| c.get(1)) {
                let host = captured.as_str().replace("0.0.0.0", "127.0.0.1");
                let signal = serde_json::json!({ "type": "flask", "host": host }).to_string();
                st.form_msg("signal", &signal);
            }
        }
    }

    /// Report a terminal runner failure: error control frame, WAIT, close.
    pub async fn send_terminal_error(&self, message: &str) {
        let mut st = self.state.lock().await;
        if !st.active() {
            return;
        }
        warn!(message, "terminal runner error");
        st.form_msg("runInfo", &format!("\r\n{message}"));
        st.to_wait();
        if let Some(primary) = &st.primary {
            primary.close();
        }
    }

    /// Report run completion: asset diff signal, end-of-run notice, close
    /// primary, re-arm enabled, WAIT.
    pub async fn send_run_complete(&self) {
        {
            let mut st = self.state.lock().await;
            if !st.active() {
                return;
            }
        }

        let diff = self.assets.diff_assets().await;

        let mut st = self.state.lock().await;
        if !st.active() {
            // The session left READY while the diff ran (e.g. explicit
            // close); the close path owns the remaining teardown.
            return;
        }
        Self::send_diff_signal(&st, &diff);
        st.form_msg("runInfo", RUN_COMPLETE_NOTICE);
        if let Some(primary) = &st.primary {
            primary.close();
        }
        st.enabled = true;
        st.to_wait();
    }

    fn send_diff_signal(st: &BrokerState, diff: &crate::assets::DiffResult) {
        use crate::assets::DiffResult;
        let msg = match diff {
            DiffResult::Oversize => {
                serde_json::json!({ "type": "file_err", "reason": "oversize" })
            }
            DiffResult::TooManyFiles => {
                serde_json::json!({ "type": "file_err", "reason": "count" })
            }
            DiffResult::Changed(details) => {
                let mut obj = details
                    .as_object()
                    .cloned()
                    .unwrap_or_default();
                obj.insert("type".into(), serde_json::Value::String("changed".into()));
                serde_json::Value::Object(obj)
            }
            DiffResult::NoOp => serde_json::json!({ "type": "changed" }),
        };
        st.form_msg("signal", &msg.to_string());
    }

    // ── Asset readiness ─────────────────────────────────────────────────────

    /// Run one readiness request against the asset provider, deduplicating
    /// concurrent requests for the same project.
    async fn handle_assets(&self, msg: &ControlMessage) -> bool {
        let Some(pid) = msg.project_id.clone() else {
            return false;
        };

        {
            let mut st = self.state.lock().await;
            if matches!(st.readiness.get(&pid), Some(AssetState::Checking)) {
                return false;
            }
            st.readiness.insert(pid.clone(), AssetState::Checking);
        }

        let descriptor = msg.descriptor();
        let ok = match self.assets.request_assets(&descriptor).await {
            Ok(ok) => ok,
            Err(err) => {
                warn!(project_id = %pid, %err, "asset provider failed");
                false
            }
        };

        let mut st = self.state.lock().await;
        if ok {
            st.readiness.insert(pid, AssetState::Ready);
        } else {
            st.readiness.insert(pid, AssetState::Error);
            st.form_msg("assets", "err");
        }
        ok
    }

    /// Await asset readiness for a submission, then install the code payload.
    ///
    /// Polls the readiness map with a short tick; after a threshold it emits
    /// a one-shot "still loading" notice without aborting the wait. The wait
    /// is abandoned if the submitting connection stops being primary.
    async fn wait_for_assets(&self, msg: ControlMessage, client_id: u64) {
        let Some(pid) = msg.project_id.clone() else {
            return;
        };

        let mut ticks: u32 = 0;
        loop {
            {
                let mut st = self.state.lock().await;
                let checking = matches!(st.readiness.get(&pid), Some(AssetState::Checking));
                if !checking || !st.is_primary(client_id) {
                    break;
                }
                ticks += 1;
                if ticks == LOAD_NOTICE_TICKS {
                    st.form_msg("assets", "start");
                }
            }
            tokio::time::sleep(ASSET_POLL).await;
        }

        {
            let st = self.state.lock().await;
            if !st.is_primary(client_id) {
                return;
            }
        }

        let ok = self.handle_assets(&msg).await;

        let mut st = self.state.lock().await;
        if !st.is_primary(client_id) {
            return;
        }
        if ok {
            st.readiness.insert(pid, AssetState::Ready);
            if st.code.is_none() {
                st.form_msg("assets", "end");
            }
            st.code = Some(msg.xml.clone().unwrap_or_default());
        } else {
            st.readiness.insert(pid, AssetState::Error);
            st.to_wait();
            if let Some(primary) = &st.primary {
                primary.close();
            }
        }
    }
}

impl RunnerSink for SessionHub {
    fn send_output<'a>(
        &'a self,
        chunk: &'a str,
        is_err: bool,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.send_output(chunk, is_err))
    }

    fn send_terminal_error<'a>(
        &'a self,
        message: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.send_terminal_error(message))
    }

    fn send_run_complete(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.send_run_complete())
    }

    fn fetch_next_input(&self) -> Pin<Box<dyn Future<Output = Option<String>> + Send + '_>> {
        Box::pin(self.fetch_next_input())
    }

    fn session_state(&self) -> Pin<Box<dyn Future<Output = SessionState> + Send + '_>> {
        Box::pin(self.state())
    }

    fn code_and_work_key(
        &self,
    ) -> Pin<Box<dyn Future<Output = Option<(String, String)>> + Send + '_>> {
        Box::pin(self.code_and_work_key())
    }

    fn mark_idle(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.mark_idle())
    }
}
