//! Server process lifecycle: launch, handshake, reuse, and teardown.

use crate::config::{self, SERVER_MODE_ARG};
use crate::document::DocumentStore;
use crate::error::{LspError, LspResult};
use crate::transport::LspTransport;
use lsp_types::{
    ClientCapabilities, CompletionClientCapabilities, CompletionItemCapability,
    InitializeParams, InitializedParams, TextDocumentClientCapabilities, Uri, WorkspaceFolder,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(8);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Where the managed server currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Handshaking,
    Ready,
}

/// Owns the single server process and its transport.
///
/// `ensure` is the only entry point for obtaining a usable transport: it
/// starts the server on first use and transparently restarts it when the
/// project root or executable changed, or the process died.
pub struct ServerManager {
    transport: Option<Arc<LspTransport>>,
    root: Option<PathBuf>,
    executable: Option<PathBuf>,
    override_path: Option<PathBuf>,
    state: ServerState,
}

impl Default for ServerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerManager {
    pub fn new() -> Self {
        Self {
            transport: None,
            root: None,
            executable: None,
            override_path: None,
            state: ServerState::Stopped,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Transport of the running server, if any. Callers needing a live
    /// server should go through `ensure` instead.
    pub fn transport(&self) -> Option<Arc<LspTransport>> {
        self.transport.as_ref().map(Arc::clone)
    }

    /// Change the executable override. A change while a server is running
    /// shuts it down gracefully; the next `ensure` starts the new binary.
    pub async fn set_override(&mut self, path: Option<PathBuf>, documents: &mut DocumentStore) {
        if self.override_path == path {
            return;
        }
        self.override_path = path;
        if self.state != ServerState::Stopped {
            self.stop(true, documents).await;
        }
    }

    /// Return a transport that is initialized against `root`, starting or
    /// restarting the server as needed.
    pub async fn ensure(
        &mut self,
        root: &Path,
        documents: &mut DocumentStore,
    ) -> LspResult<Arc<LspTransport>> {
        if self.state == ServerState::Ready {
            let same_root = self.root.as_deref() == Some(root);
            let same_binary = match config::resolve_server_executable(self.override_path.as_deref())
            {
                Ok(resolved) => self.executable.as_deref() == Some(resolved.as_path()),
                Err(_) => false,
            };
            let alive = match &self.transport {
                Some(transport) => transport.is_connected().await,
                None => false,
            };

            if same_root && same_binary && alive {
                if let Some(transport) = &self.transport {
                    return Ok(Arc::clone(transport));
                }
            }
            debug!(
                same_root,
                same_binary, alive, "Server no longer matches, restarting"
            );
            self.stop(alive, documents).await;
        }

        self.start(root, documents).await
    }

    /// Launch the server and run the initialize handshake.
    async fn start(
        &mut self,
        root: &Path,
        documents: &mut DocumentStore,
    ) -> LspResult<Arc<LspTransport>> {
        documents.clear();
        self.state = ServerState::Starting;

        let executable = match config::resolve_server_executable(self.override_path.as_deref()) {
            Ok(path) => path,
            Err(e) => {
                self.state = ServerState::Stopped;
                return Err(e);
            }
        };

        info!(executable = %executable.display(), root = %root.display(), "Starting language server");

        let mut env = HashMap::new();
        env.insert(
            "PATH".to_string(),
            config::augmented_path().to_string_lossy().into_owned(),
        );

        let transport = match LspTransport::spawn(&executable, &[SERVER_MODE_ARG], &env, Some(root))
            .await
        {
            Ok(transport) => transport,
            Err(e) => {
                self.state = ServerState::Stopped;
                return Err(e);
            }
        };

        self.state = ServerState::Handshaking;
        if let Err(e) = self.handshake(&transport, root).await {
            warn!(error = %e, "Initialize handshake failed");
            transport.disconnect().await;
            self.state = ServerState::Stopped;
            return Err(e);
        }

        self.transport = Some(Arc::clone(&transport));
        self.root = Some(root.to_path_buf());
        self.executable = Some(executable);
        self.state = ServerState::Ready;
        info!("Language server ready");
        Ok(transport)
    }

    async fn handshake(&self, transport: &LspTransport, root: &Path) -> LspResult<()> {
        let root_uri: Uri = format!("file://{}", root.display())
            .parse()
            .map_err(|e| LspError::InvalidUri(format!("{}: {e}", root.display())))?;

        #[allow(deprecated)]
        let params = InitializeParams {
            process_id: Some(std::process::id()),
            capabilities: ClientCapabilities {
                text_document: Some(TextDocumentClientCapabilities {
                    completion: Some(CompletionClientCapabilities {
                        completion_item: Some(CompletionItemCapability {
                            snippet_support: Some(true),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            workspace_folders: Some(vec![WorkspaceFolder {
                uri: root_uri,
                name: root
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "workspace".to_string()),
            }]),
            ..Default::default()
        };

        let result = transport
            .request(
                "initialize",
                Some(serde_json::to_value(params)?),
                INITIALIZE_TIMEOUT,
            )
            .await?;
        debug!(
            capabilities = %result
                .get("capabilities")
                .cloned()
                .unwrap_or_default(),
            "Server initialized"
        );

        transport
            .notify(
                "initialized",
                Some(serde_json::to_value(InitializedParams {})?),
            )
            .await
    }

    /// Tear the server down. With `send_shutdown` the protocol-level shutdown
    /// request is attempted first; either way the process ends and every
    /// document session is dropped.
    pub async fn stop(&mut self, send_shutdown: bool, documents: &mut DocumentStore) {
        if let Some(transport) = self.transport.take() {
            if send_shutdown && transport.is_connected().await {
                if let Err(e) = transport
                    .request("shutdown", None, SHUTDOWN_TIMEOUT)
                    .await
                {
                    debug!(error = %e, "Shutdown request failed");
                }
                if let Err(e) = transport.notify("exit", None).await {
                    debug!(error = %e, "Exit notification failed");
                }
            }
            transport.disconnect().await;
            info!("Language server stopped");
        }
        documents.clear();
        self.root = None;
        self.executable = None;
        self.state = ServerState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_with_bad_override_fails_to_launch() {
        let mut manager = ServerManager::new();
        let mut documents = DocumentStore::new();
        manager
            .set_override(Some(PathBuf::from("/nonexistent/phpactor")), &mut documents)
            .await;

        let result = manager
            .ensure(Path::new("/tmp"), &mut documents)
            .await;
        assert!(matches!(result, Err(LspError::LaunchFailed(_))));
        assert_eq!(manager.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let mut manager = ServerManager::new();
        let mut documents = DocumentStore::new();
        manager.stop(true, &mut documents).await;
        assert_eq!(manager.state(), ServerState::Stopped);
        assert!(documents.is_empty());
    }

    #[tokio::test]
    async fn test_override_change_while_stopped_keeps_state() {
        let mut manager = ServerManager::new();
        let mut documents = DocumentStore::new();
        manager
            .set_override(Some(PathBuf::from("/a")), &mut documents)
            .await;
        manager
            .set_override(Some(PathBuf::from("/a")), &mut documents)
            .await;
        assert_eq!(manager.state(), ServerState::Stopped);
    }
}
