//! The editor-facing orchestrator: debounces keystrokes into document syncs,
//! turns trigger characters into immediate completion requests, and discards
//! completion results that a newer request has made stale.

use crate::completion::{self, CompletionCandidate, CompletionRequest};
use crate::config::LspSettings;
use crate::document::{self, DocumentStore};
use crate::server::ServerManager;
use lsp_types::Location;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const SYNC_DEBOUNCE: Duration = Duration::from_millis(120);
const COMPLETION_DEBOUNCE: Duration = Duration::from_millis(200);

/// Characters that request completion immediately: member access (`->`,
/// `::`), variables, and namespace separators.
const TRIGGER_CHARACTERS: [char; 4] = ['>', ':', '$', '\\'];

/// Events the engine pushes back to the editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// The editor should call `completion_items` with its current cursor.
    RequestCompletion,
}

/// How a single edit affects completion scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EditClass {
    /// Request completion now.
    Trigger(char),
    /// Ordinary typing or deletion; worth a debounced request.
    Continuation,
    /// Programmatic or multi-character replacement; cancel instead.
    Other,
}

fn classify_edit(replacement: &str) -> EditClass {
    let mut chars = replacement.chars();
    match (chars.next(), chars.next()) {
        (None, _) => EditClass::Continuation,
        (Some(ch), None) if TRIGGER_CHARACTERS.contains(&ch) => EditClass::Trigger(ch),
        (Some(ch), None) if ch.is_alphanumeric() || ch == '_' => EditClass::Continuation,
        _ => EditClass::Other,
    }
}

/// Protocol-side state. One lock serializes every protocol operation; only
/// the transport's pipe readers run outside it.
struct Session {
    server: ServerManager,
    documents: DocumentStore,
}

struct ScheduledTask {
    cancel: CancellationToken,
}

impl ScheduledTask {
    fn cancel(self) {
        self.cancel.cancel();
    }
}

/// Editor-side state, held separately from the session so scheduling never
/// waits on a protocol round trip.
struct EngineState {
    enabled: bool,
    auto_trigger: bool,
    project_root: Option<PathBuf>,
    document_uri: Option<String>,
    config_signature: Option<String>,
    pending_trigger: Option<char>,
    latest_text: String,
    sync_task: Option<ScheduledTask>,
    completion_task: Option<ScheduledTask>,
}

/// The completion engine the editor talks to. Cheap to clone; all clones
/// share one server session.
#[derive(Clone)]
pub struct CompletionEngine {
    session: Arc<Mutex<Session>>,
    state: Arc<Mutex<EngineState>>,
    request_token: Arc<AtomicU64>,
    events: UnboundedSender<EngineEvent>,
}

impl CompletionEngine {
    pub fn new() -> (Self, UnboundedReceiver<EngineEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let engine = Self {
            session: Arc::new(Mutex::new(Session {
                server: ServerManager::new(),
                documents: DocumentStore::new(),
            })),
            state: Arc::new(Mutex::new(EngineState {
                enabled: false,
                auto_trigger: false,
                project_root: None,
                document_uri: None,
                config_signature: None,
                pending_trigger: None,
                latest_text: String::new(),
                sync_task: None,
                completion_task: None,
            })),
            request_token: Arc::new(AtomicU64::new(0)),
            events,
        };
        (engine, receiver)
    }

    /// Apply editor settings. Re-applying identical settings is a no-op; a
    /// real change reconfigures the session, closing the previous document
    /// and restarting the server as needed.
    pub async fn configure(&self, settings: &LspSettings) {
        let (previous_uri, schedule_sync) = {
            let mut state = self.state.lock().await;
            let signature = settings.signature();
            if state.config_signature.as_deref() == Some(signature.as_str()) {
                return;
            }
            state.config_signature = Some(signature);

            let new_uri = settings
                .project_root
                .as_deref()
                .map(|root| document::scratch_uri(root));
            let previous_uri = state.document_uri.take();
            let close_previous = previous_uri.is_some()
                && (previous_uri != new_uri || !settings.enabled);

            state.enabled = settings.enabled;
            state.auto_trigger = settings.auto_trigger;
            state.project_root = settings.project_root.clone();
            state.document_uri = new_uri.clone();
            state.pending_trigger = None;

            if !settings.enabled {
                if let Some(task) = state.sync_task.take() {
                    task.cancel();
                }
                if let Some(task) = state.completion_task.take() {
                    task.cancel();
                }
            }

            (
                close_previous.then_some(previous_uri).flatten(),
                settings.enabled && new_uri.is_some(),
            )
        };

        {
            let mut session = self.session.lock().await;
            let Session { server, documents } = &mut *session;
            server
                .set_override(settings.server_path.clone(), documents)
                .await;
            if let Some(uri) = previous_uri {
                if let Some(transport) = server.transport() {
                    if let Err(e) = documents.close(&transport, &uri).await {
                        debug!(error = %e, "Failed to close previous document");
                    }
                }
            }
        }

        if schedule_sync {
            self.schedule_sync(Duration::ZERO).await;
        }
    }

    /// React to one editor edit. Always reschedules the document sync;
    /// depending on the edit, also requests or cancels completion.
    pub async fn handle_edit(&self, replacement: &str, full_text: &str) {
        let class = classify_edit(replacement);
        {
            let mut state = self.state.lock().await;
            if !state.enabled {
                return;
            }
            state.latest_text = full_text.to_string();

            if !state.auto_trigger {
                if let Some(task) = state.completion_task.take() {
                    task.cancel();
                }
            } else {
                match class {
                    EditClass::Trigger(ch) => {
                        if let Some(task) = state.completion_task.take() {
                            task.cancel();
                        }
                        state.pending_trigger = Some(ch);
                        let _ = self.events.send(EngineEvent::RequestCompletion);
                    }
                    EditClass::Continuation => {
                        self.schedule_completion(&mut state);
                    }
                    EditClass::Other => {
                        if let Some(task) = state.completion_task.take() {
                            task.cancel();
                        }
                        state.pending_trigger = None;
                    }
                }
            }
        }
        self.schedule_sync(SYNC_DEBOUNCE).await;
    }

    /// Fetch completion candidates for the editor's current cursor.
    ///
    /// Captures a fresh request token; if another request starts while this
    /// one is in flight, this one's result is discarded as stale.
    pub async fn completion_items(
        &self,
        full_text: &str,
        utf16_offset: usize,
    ) -> Vec<CompletionCandidate> {
        let token = self.request_token.fetch_add(1, Ordering::SeqCst) + 1;

        let request = {
            let mut state = self.state.lock().await;
            if !state.enabled {
                return Vec::new();
            }
            let (Some(uri), Some(root)) =
                (state.document_uri.clone(), state.project_root.clone())
            else {
                return Vec::new();
            };
            state.latest_text = full_text.to_string();
            CompletionRequest {
                uri,
                root,
                text: full_text.to_string(),
                offset: utf16_offset,
                trigger: state.pending_trigger.take(),
            }
        };

        let candidates = {
            let mut session = self.session.lock().await;
            let Session { server, documents } = &mut *session;
            completion::complete(server, documents, &request).await
        };

        if self.request_token.load(Ordering::SeqCst) != token {
            debug!(token, "Discarding stale completion result");
            return Vec::new();
        }
        candidates
    }

    /// Definitions for the symbol at the cursor; empty when disabled or
    /// nothing is found.
    pub async fn definitions(&self, full_text: &str, utf16_offset: usize) -> Vec<Location> {
        let (uri, root) = {
            let state = self.state.lock().await;
            if !state.enabled {
                return Vec::new();
            }
            match (state.document_uri.clone(), state.project_root.clone()) {
                (Some(uri), Some(root)) => (uri, root),
                _ => return Vec::new(),
            }
        };

        let mut session = self.session.lock().await;
        let Session { server, documents } = &mut *session;
        crate::definition::definitions(server, documents, &uri, &root, full_text, utf16_offset)
            .await
    }

    /// Tear the engine down: cancel scheduled work, close the open document,
    /// and stop the server.
    pub async fn close(&self) {
        let uri = {
            let mut state = self.state.lock().await;
            if let Some(task) = state.sync_task.take() {
                task.cancel();
            }
            if let Some(task) = state.completion_task.take() {
                task.cancel();
            }
            state.enabled = false;
            state.document_uri.take()
        };

        let mut session = self.session.lock().await;
        let Session { server, documents } = &mut *session;
        if let (Some(uri), Some(transport)) = (uri, server.transport()) {
            if let Err(e) = documents.close(&transport, &uri).await {
                debug!(error = %e, "Failed to close document on shutdown");
            }
        }
        server.stop(true, documents).await;
    }

    /// Replace any scheduled sync with a new one after `delay`.
    async fn schedule_sync(&self, delay: Duration) {
        let cancel = CancellationToken::new();
        {
            let mut state = self.state.lock().await;
            if !state.enabled {
                return;
            }
            if let Some(task) = state.sync_task.take() {
                task.cancel();
            }
            state.sync_task = Some(ScheduledTask {
                cancel: cancel.clone(),
            });
        }

        let engine = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => engine.sync_document().await,
            }
        });
    }

    /// Replace any debounced completion request with a new one.
    fn schedule_completion(&self, state: &mut EngineState) {
        if let Some(task) = state.completion_task.take() {
            task.cancel();
        }
        let cancel = CancellationToken::new();
        state.completion_task = Some(ScheduledTask {
            cancel: cancel.clone(),
        });

        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(COMPLETION_DEBOUNCE) => {
                    let _ = events.send(EngineEvent::RequestCompletion);
                }
            }
        });
    }

    /// Push the latest text to the server. A dead server is stopped quietly;
    /// the next request restarts it.
    async fn sync_document(&self) {
        let (uri, root, text) = {
            let state = self.state.lock().await;
            if !state.enabled {
                return;
            }
            match (state.document_uri.clone(), state.project_root.clone()) {
                (Some(uri), Some(root)) => (uri, root, state.latest_text.clone()),
                _ => return,
            }
        };

        let mut session = self.session.lock().await;
        let Session { server, documents } = &mut *session;
        let result = async {
            let transport = server.ensure(&root, documents).await?;
            documents.open_or_update(&transport, &uri, &text).await
        }
        .await;

        match result {
            Ok(_) => {}
            Err(crate::error::LspError::Disconnected) => {
                debug!("Server gone during sync, stopping");
                server.stop(false, documents).await;
            }
            Err(e) => warn!(error = %e, "Document sync failed"),
        }
    }
}
