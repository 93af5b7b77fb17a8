//! Open-document tracking and full-text synchronization.
//!
//! The editor hands over bare PHP fragments; the server wants syntactically
//! valid top-level documents, so fragments that do not already start with the
//! open tag get one prepended line. The resulting one-line shift is recorded
//! per session and undone on every range that comes back from the server.

use crate::error::{LspError, LspResult};
use crate::transport::LspTransport;
use lsp_types::{
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    TextDocumentContentChangeEvent, TextDocumentIdentifier, TextDocumentItem, Uri,
    VersionedTextDocumentIdentifier,
};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// Fixed scratch filename inside the project root.
pub const SCRATCH_FILE_NAME: &str = ".tinkerpad-scratch.php";

const PHP_OPEN_TAG: &str = "<?php";
const LANGUAGE_ID: &str = "php";

/// File URI of the scratch document for a project.
pub fn scratch_uri(root: &Path) -> String {
    format!("file://{}/{}", root.display(), SCRATCH_FILE_NAME)
}

/// One open document as the server sees it.
#[derive(Debug, Clone)]
pub struct DocumentSession {
    /// Strictly increasing, starting at 1.
    pub version: i32,
    /// The editor's unwrapped text.
    pub source_text: String,
    /// Text actually sent to the server.
    pub protocol_text: String,
    /// Lines prepended to `source_text` to form `protocol_text` (0 or 1).
    pub line_offset: u32,
}

/// Wrap a bare fragment so the server sees a valid top-level PHP document.
fn wrap_source(text: &str) -> (String, u32) {
    if text.trim_start().starts_with(PHP_OPEN_TAG) {
        (text.to_string(), 0)
    } else {
        (format!("{PHP_OPEN_TAG}\n{text}"), 1)
    }
}

fn parse_uri(uri: &str) -> LspResult<Uri> {
    uri.parse()
        .map_err(|e| LspError::InvalidUri(format!("{uri}: {e}")))
}

/// Tracks every open document session. Cleared wholesale when the server
/// session it was opened against goes away.
#[derive(Debug, Default)]
pub struct DocumentStore {
    sessions: HashMap<String, DocumentSession>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uri: &str) -> Option<&DocumentSession> {
        self.sessions.get(uri)
    }

    /// Active line-offset correction for a document; 0 when unknown.
    pub fn line_offset(&self, uri: &str) -> u32 {
        self.sessions.get(uri).map_or(0, |s| s.line_offset)
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Forget every session without notifying the server. Used when the
    /// server is gone or about to be replaced; documents must be re-opened
    /// against the next session.
    pub fn clear(&mut self) {
        if !self.sessions.is_empty() {
            debug!(count = self.sessions.len(), "Dropping document sessions");
            self.sessions.clear();
        }
    }

    /// Open the document, or sync its full text if already open.
    ///
    /// Idempotent against redundant syncs: an update with unchanged text does
    /// nothing. Returns the session's line offset.
    pub async fn open_or_update(
        &mut self,
        transport: &LspTransport,
        uri: &str,
        text: &str,
    ) -> LspResult<u32> {
        if let Some(session) = self.sessions.get(uri) {
            if session.source_text == text {
                return Ok(session.line_offset);
            }
        }

        let (protocol_text, line_offset) = wrap_source(text);

        if let Some(session) = self.sessions.get_mut(uri) {
            session.version += 1;
            session.source_text = text.to_string();
            session.protocol_text = protocol_text.clone();
            session.line_offset = line_offset;

            let params = DidChangeTextDocumentParams {
                text_document: VersionedTextDocumentIdentifier {
                    uri: parse_uri(uri)?,
                    version: session.version,
                },
                // Full-document replacement; no incremental ranges.
                content_changes: vec![TextDocumentContentChangeEvent {
                    range: None,
                    range_length: None,
                    text: protocol_text.clone(),
                }],
            };
            transport
                .notify("textDocument/didChange", Some(serde_json::to_value(params)?))
                .await?;
        } else {
            let session = DocumentSession {
                version: 1,
                source_text: text.to_string(),
                protocol_text: protocol_text.clone(),
                line_offset,
            };

            let params = DidOpenTextDocumentParams {
                text_document: TextDocumentItem {
                    uri: parse_uri(uri)?,
                    language_id: LANGUAGE_ID.to_string(),
                    version: session.version,
                    text: protocol_text.clone(),
                },
            };
            self.sessions.insert(uri.to_string(), session);
            transport
                .notify("textDocument/didOpen", Some(serde_json::to_value(params)?))
                .await?;
        }

        mirror_to_disk(uri, &protocol_text).await;
        Ok(line_offset)
    }

    /// Close and forget a document. Unknown URIs are a no-op.
    pub async fn close(&mut self, transport: &LspTransport, uri: &str) -> LspResult<()> {
        if self.sessions.remove(uri).is_none() {
            return Ok(());
        }
        let params = DidCloseTextDocumentParams {
            text_document: TextDocumentIdentifier {
                uri: parse_uri(uri)?,
            },
        };
        transport
            .notify("textDocument/didClose", Some(serde_json::to_value(params)?))
            .await
    }
}

/// Keep the scratch file in step with the in-memory buffer, so any
/// file-backed analysis the server runs sees the same content.
async fn mirror_to_disk(uri: &str, text: &str) {
    let Some(path) = uri.strip_prefix("file://") else {
        return;
    };
    if let Err(e) = tokio::fs::write(path, text).await {
        warn!(path, error = %e, "Failed to mirror scratch file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as EnvMap;

    #[test]
    fn test_wrap_source_bare_fragment() {
        let (wrapped, offset) = wrap_source("$x = 1;");
        assert_eq!(wrapped, "<?php\n$x = 1;");
        assert_eq!(offset, 1);
    }

    #[test]
    fn test_wrap_source_already_tagged() {
        let (wrapped, offset) = wrap_source("<?php\necho 1;");
        assert_eq!(wrapped, "<?php\necho 1;");
        assert_eq!(offset, 0);

        // Leading whitespace before the tag still counts.
        let (_, offset) = wrap_source("  \n<?php echo 1;");
        assert_eq!(offset, 0);
    }

    #[test]
    fn test_scratch_uri() {
        let uri = scratch_uri(Path::new("/home/user/project"));
        assert_eq!(uri, "file:///home/user/project/.tinkerpad-scratch.php");
    }

    #[cfg(unix)]
    async fn cat_transport() -> std::sync::Arc<LspTransport> {
        // `cat` keeps its pipes open and swallows our notifications.
        LspTransport::spawn("cat", &[], &EnvMap::new(), None)
            .await
            .unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_open_is_idempotent_for_same_text() {
        let transport = cat_transport().await;
        let dir = tempfile::tempdir().unwrap();
        let uri = scratch_uri(dir.path());
        let mut store = DocumentStore::new();

        store
            .open_or_update(&transport, &uri, "$a = 1;")
            .await
            .unwrap();
        assert_eq!(store.get(&uri).unwrap().version, 1);

        // Same text: version must not move.
        store
            .open_or_update(&transport, &uri, "$a = 1;")
            .await
            .unwrap();
        assert_eq!(store.get(&uri).unwrap().version, 1);

        // Changed text: exactly one increment.
        store
            .open_or_update(&transport, &uri, "$a = 2;")
            .await
            .unwrap();
        assert_eq!(store.get(&uri).unwrap().version, 2);

        transport.disconnect().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_line_offset_tracks_wrapping() {
        let transport = cat_transport().await;
        let dir = tempfile::tempdir().unwrap();
        let uri = scratch_uri(dir.path());
        let mut store = DocumentStore::new();

        let offset = store
            .open_or_update(&transport, &uri, "$a = 1;")
            .await
            .unwrap();
        assert_eq!(offset, 1);

        let offset = store
            .open_or_update(&transport, &uri, "<?php\n$a = 1;")
            .await
            .unwrap();
        assert_eq!(offset, 0);
        assert_eq!(store.line_offset(&uri), 0);

        transport.disconnect().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_mirrors_protocol_text_to_scratch_file() {
        let transport = cat_transport().await;
        let dir = tempfile::tempdir().unwrap();
        let uri = scratch_uri(dir.path());
        let mut store = DocumentStore::new();

        store
            .open_or_update(&transport, &uri, "echo 'hi';")
            .await
            .unwrap();

        let on_disk = std::fs::read_to_string(dir.path().join(SCRATCH_FILE_NAME)).unwrap();
        assert_eq!(on_disk, "<?php\necho 'hi';");

        transport.disconnect().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_unknown_uri_is_noop() {
        let transport = cat_transport().await;
        let mut store = DocumentStore::new();
        store
            .close(&transport, "file:///tmp/never-opened.php")
            .await
            .unwrap();
        transport.disconnect().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_clear_drops_all_sessions() {
        let transport = cat_transport().await;
        let dir = tempfile::tempdir().unwrap();
        let uri = scratch_uri(dir.path());
        let mut store = DocumentStore::new();

        store
            .open_or_update(&transport, &uri, "$a = 1;")
            .await
            .unwrap();
        assert!(!store.is_empty());

        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.line_offset(&uri), 0);

        transport.disconnect().await;
    }
}
