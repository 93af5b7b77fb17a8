//! Language intelligence for the tinkerpad scratch editor.
//!
//! Drives a [phpactor](https://phpactor.github.io/) language server over
//! stdio to provide completion and go-to-definition for the single scratch
//! document the editor works on. The crate owns the whole protocol stack:
//!
//! - [`transport`]: `Content-Length`-framed JSON-RPC over the child
//!   process's pipes, with request/response correlation and timeouts.
//! - [`server`]: process lifecycle. Launch, initialize handshake, reuse
//!   across calls, restart on root or binary changes, graceful shutdown.
//! - [`document`]: versioned full-text sync of the scratch document,
//!   including the `<?php` wrapping that keeps bare fragments parseable.
//! - [`completion`] / [`definition`]: the request pipelines, response
//!   normalization, and the coordinate corrections back into editor space.
//! - [`engine`]: the editor-facing orchestrator. Debouncing, trigger
//!   characters, stale-result discard, and configuration changes.
//!
//! The editor only ever talks to [`CompletionEngine`]:
//!
//! ```no_run
//! use tinkerpad_lsp::{CompletionEngine, EngineEvent, LspSettings};
//!
//! # async fn example() {
//! let (engine, mut events) = CompletionEngine::new();
//! engine
//!     .configure(&LspSettings {
//!         project_root: Some("/home/user/project".into()),
//!         ..Default::default()
//!     })
//!     .await;
//!
//! engine.handle_edit(">", "$user->").await;
//! if let Some(EngineEvent::RequestCompletion) = events.recv().await {
//!     let candidates = engine.completion_items("$user->", 7).await;
//!     for candidate in candidates {
//!         println!("{}", candidate.label);
//!     }
//! }
//! # }
//! ```

pub mod completion;
pub mod config;
pub mod definition;
pub mod document;
pub mod engine;
pub mod error;
pub mod position;
pub mod server;
pub mod snippet;
pub mod transport;

pub use completion::{CandidateEdit, CompletionCandidate, CompletionRequest};
pub use config::LspSettings;
pub use document::{scratch_uri, DocumentStore, SCRATCH_FILE_NAME};
pub use engine::{CompletionEngine, EngineEvent};
pub use error::{LspError, LspResult};
pub use server::{ServerManager, ServerState};
pub use snippet::{ResolvedSnippet, Selection};
pub use transport::LspTransport;
