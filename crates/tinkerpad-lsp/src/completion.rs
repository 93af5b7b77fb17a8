//! The completion pipeline: document sync, the `textDocument/completion`
//! round trip, response normalization, and the retry policy.
//!
//! Errors never escape this module's public entry point; a failed pipeline
//! produces an empty candidate list and a log line.

use crate::document::DocumentStore;
use crate::error::{LspError, LspResult};
use crate::position;
use crate::server::ServerManager;
use crate::snippet::{self, Selection};
use lsp_types::{
    CompletionContext, CompletionItemKind, CompletionParams, CompletionTriggerKind,
    InsertTextFormat, PartialResultParams, Position, Range, TextDocumentIdentifier,
    TextDocumentPositionParams, WorkDoneProgressParams,
};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

const COMPLETION_TIMEOUT: Duration = Duration::from_secs(3);
const RETRY_TIMEOUT: Duration = Duration::from_millis(1500);
const RESOLVE_TIMEOUT: Duration = Duration::from_millis(800);

/// A text edit remapped into editor coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateEdit {
    pub range: Range,
    pub new_text: String,
}

/// One completion candidate, normalized for the editor.
#[derive(Debug, Clone)]
pub struct CompletionCandidate {
    pub label: String,
    pub detail: Option<String>,
    pub documentation: Option<String>,
    pub sort_text: Option<String>,
    pub kind: Option<CompletionItemKind>,
    /// Primary edit; `None` means insert `insert_text` at the cursor.
    pub edit: Option<CandidateEdit>,
    pub insert_text: String,
    pub additional_edits: Vec<CandidateEdit>,
    /// Post-insert selection relative to the inserted text, from snippet
    /// resolution.
    pub selection: Option<Selection>,
    /// Original server item, kept for `completionItem/resolve`.
    pub(crate) raw: Value,
}

/// One request through the pipeline.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub uri: String,
    pub root: PathBuf,
    pub text: String,
    /// Cursor as a UTF-16 offset into `text`.
    pub offset: usize,
    /// The character that triggered this request, if any.
    pub trigger: Option<char>,
}

/// Run one completion request end to end.
///
/// Timeouts get one faster retry without documentation resolution; a dead
/// server gets one restart-and-retry. Anything else yields no candidates.
pub async fn complete(
    server: &mut ServerManager,
    documents: &mut DocumentStore,
    request: &CompletionRequest,
) -> Vec<CompletionCandidate> {
    match attempt(server, documents, request, COMPLETION_TIMEOUT, true).await {
        Ok(candidates) => candidates,
        Err(LspError::Timeout) => {
            debug!("Completion timed out, retrying once");
            match attempt(server, documents, request, RETRY_TIMEOUT, false).await {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!(error = %e, "Completion retry failed");
                    Vec::new()
                }
            }
        }
        Err(LspError::Disconnected) => {
            debug!("Server gone during completion, restarting once");
            server.stop(false, documents).await;
            match attempt(server, documents, request, COMPLETION_TIMEOUT, false).await {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!(error = %e, "Completion after restart failed");
                    Vec::new()
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "Completion failed");
            Vec::new()
        }
    }
}

async fn attempt(
    server: &mut ServerManager,
    documents: &mut DocumentStore,
    request: &CompletionRequest,
    timeout: Duration,
    with_resolve: bool,
) -> LspResult<Vec<CompletionCandidate>> {
    let transport = server.ensure(&request.root, documents).await?;
    let line_offset = documents
        .open_or_update(&transport, &request.uri, &request.text)
        .await?;

    let mut protocol_position = position::position_at(&request.text, request.offset);
    protocol_position.line += line_offset;

    let context = Some(match request.trigger {
        Some(ch) => CompletionContext {
            trigger_kind: CompletionTriggerKind::TRIGGER_CHARACTER,
            trigger_character: Some(ch.to_string()),
        },
        None => CompletionContext {
            trigger_kind: CompletionTriggerKind::INVOKED,
            trigger_character: None,
        },
    });

    let params = CompletionParams {
        text_document_position: TextDocumentPositionParams {
            text_document: TextDocumentIdentifier {
                uri: request
                    .uri
                    .parse()
                    .map_err(|e| LspError::InvalidUri(format!("{}: {e}", request.uri)))?,
            },
            position: protocol_position,
        },
        work_done_progress_params: WorkDoneProgressParams::default(),
        partial_result_params: PartialResultParams::default(),
        context,
    };

    let result = transport
        .request(
            "textDocument/completion",
            Some(serde_json::to_value(params)?),
            timeout,
        )
        .await?;

    let mut candidates = parse_candidates(&result, line_offset);
    if with_resolve {
        resolve_top(&transport, &mut candidates).await;
    }
    Ok(candidates)
}

/// Fill in documentation for the first candidate via `completionItem/resolve`.
/// Best effort: any failure leaves the candidate as returned.
async fn resolve_top(transport: &crate::transport::LspTransport, candidates: &mut [CompletionCandidate]) {
    let Some(top) = candidates.first_mut() else {
        return;
    };
    if top.documentation.is_some() {
        return;
    }

    match transport
        .request(
            "completionItem/resolve",
            Some(top.raw.clone()),
            RESOLVE_TIMEOUT,
        )
        .await
    {
        Ok(resolved) => {
            if top.documentation.is_none() {
                top.documentation = resolved.get("documentation").and_then(documentation_text);
            }
            if top.detail.is_none() {
                top.detail = resolved
                    .get("detail")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
        }
        Err(e) => debug!(label = %top.label, error = %e, "Item resolve failed"),
    }
}

/// Wire shape of a completion item, read leniently: unknown fields are
/// ignored and a missing label yields an empty string that drops the item.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawItem {
    #[serde(default)]
    label: String,
    detail: Option<String>,
    documentation: Option<Value>,
    sort_text: Option<String>,
    kind: Option<CompletionItemKind>,
    insert_text: Option<String>,
    insert_text_format: Option<InsertTextFormat>,
    text_edit: Option<Value>,
    #[serde(default)]
    additional_text_edits: Vec<RawEdit>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEdit {
    range: Range,
    new_text: String,
}

/// Normalize a `textDocument/completion` result into sorted candidates.
///
/// Accepts both the bare-array and `CompletionList` shapes. Items without a
/// label are dropped. Candidates sort by `sortText` (falling back to the
/// label), case-insensitively, with the label as tie-breaker.
pub fn parse_candidates(result: &Value, line_offset: u32) -> Vec<CompletionCandidate> {
    let items = match result {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("items").and_then(Value::as_array) {
            Some(items) => items.as_slice(),
            None => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    let mut candidates: Vec<CompletionCandidate> = items
        .iter()
        .filter_map(|item| candidate_from_item(item, line_offset))
        .collect();

    candidates.sort_by(|a, b| {
        let a_key = a.sort_text.as_deref().unwrap_or(&a.label).to_lowercase();
        let b_key = b.sort_text.as_deref().unwrap_or(&b.label).to_lowercase();
        a_key.cmp(&b_key).then_with(|| a.label.cmp(&b.label))
    });
    candidates
}

fn candidate_from_item(item: &Value, line_offset: u32) -> Option<CompletionCandidate> {
    let raw: RawItem = match serde_json::from_value(item.clone()) {
        Ok(raw) => raw,
        Err(e) => {
            debug!(error = %e, "Skipping malformed completion item");
            return None;
        }
    };
    if raw.label.is_empty() {
        return None;
    }

    let (edit_range, edit_text) = primary_edit(raw.text_edit.as_ref());
    let mut insert_text = edit_text
        .or(raw.insert_text)
        .unwrap_or_else(|| raw.label.clone());

    let mut selection = None;
    if raw.insert_text_format == Some(InsertTextFormat::SNIPPET) {
        let resolved = snippet::resolve(&insert_text);
        insert_text = resolved.text;
        selection = resolved.selection;
    }

    // An edit addressing the prepended line has no editor counterpart; the
    // candidate stays usable as a plain cursor insert.
    let edit = edit_range
        .and_then(|range| remap_range(range, line_offset))
        .map(|range| CandidateEdit {
            range,
            new_text: insert_text.clone(),
        });

    let additional_edits = raw
        .additional_text_edits
        .into_iter()
        .filter_map(|e| {
            remap_range(e.range, line_offset).map(|range| CandidateEdit {
                range,
                new_text: e.new_text,
            })
        })
        .collect();

    Some(CompletionCandidate {
        label: raw.label,
        detail: raw.detail,
        documentation: raw.documentation.as_ref().and_then(documentation_text),
        sort_text: raw.sort_text,
        kind: raw.kind,
        edit,
        insert_text,
        additional_edits,
        selection,
        raw: item.clone(),
    })
}

/// Extract range and text from either a plain `TextEdit` or an
/// `InsertReplaceEdit` (which carries `insert` and `replace` ranges; the
/// replace range wins).
fn primary_edit(text_edit: Option<&Value>) -> (Option<Range>, Option<String>) {
    let Some(edit) = text_edit else {
        return (None, None);
    };
    let new_text = edit
        .get("newText")
        .and_then(Value::as_str)
        .map(str::to_string);
    let range = edit
        .get("range")
        .or_else(|| edit.get("replace"))
        .or_else(|| edit.get("insert"))
        .and_then(|r| serde_json::from_value(r.clone()).ok());
    (range, new_text)
}

/// Shift a protocol range back into editor coordinates. A range touching the
/// synthetic first line has no editor counterpart and is dropped.
pub fn remap_range(range: Range, line_offset: u32) -> Option<Range> {
    if range.start.line < line_offset || range.end.line < line_offset {
        return None;
    }
    Some(Range {
        start: Position {
            line: range.start.line - line_offset,
            character: range.start.character,
        },
        end: Position {
            line: range.end.line - line_offset,
            character: range.end.character,
        },
    })
}

/// Documentation is either a plain string or a `MarkupContent` object.
fn documentation_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("value")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn range(start_line: u32, start_char: u32, end_line: u32, end_char: u32) -> Range {
        Range {
            start: Position {
                line: start_line,
                character: start_char,
            },
            end: Position {
                line: end_line,
                character: end_char,
            },
        }
    }

    #[test]
    fn test_parse_bare_array_and_list_shapes() {
        let bare = json!([{"label": "strlen"}]);
        assert_eq!(parse_candidates(&bare, 0).len(), 1);

        let list = json!({"isIncomplete": false, "items": [{"label": "strlen"}]});
        assert_eq!(parse_candidates(&list, 0).len(), 1);

        assert!(parse_candidates(&json!(null), 0).is_empty());
        assert!(parse_candidates(&json!({"items": null}), 0).is_empty());
    }

    #[test]
    fn test_items_without_label_are_dropped() {
        let result = json!([
            {"label": "strlen"},
            {"label": ""},
            {"detail": "no label at all"},
        ]);
        let candidates = parse_candidates(&result, 0);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].label, "strlen");
    }

    #[test]
    fn test_sorted_by_sort_text_then_label() {
        let result = json!([
            {"label": "strlen", "sortText": "b"},
            {"label": "str_replace", "sortText": "a"},
            {"label": "array_map"},
        ]);
        let candidates = parse_candidates(&result, 0);
        let labels: Vec<&str> = candidates.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, ["str_replace", "strlen", "array_map"]);
    }

    #[test]
    fn test_sort_is_case_insensitive() {
        let result = json!([
            {"label": "Zebra"},
            {"label": "apple"},
        ]);
        let candidates = parse_candidates(&result, 0);
        assert_eq!(candidates[0].label, "apple");
    }

    #[test]
    fn test_text_edit_range_is_remapped() {
        let result = json!([{
            "label": "strlen",
            "textEdit": {
                "range": {
                    "start": {"line": 3, "character": 0},
                    "end": {"line": 3, "character": 3},
                },
                "newText": "strlen",
            },
        }]);
        let candidates = parse_candidates(&result, 1);
        let edit = candidates[0].edit.as_ref().unwrap();
        assert_eq!(edit.range, range(2, 0, 2, 3));
        assert_eq!(edit.new_text, "strlen");
    }

    #[test]
    fn test_edit_on_synthetic_line_keeps_candidate_without_edit() {
        let result = json!([{
            "label": "declare",
            "textEdit": {
                "range": {
                    "start": {"line": 0, "character": 0},
                    "end": {"line": 0, "character": 4},
                },
                "newText": "declare",
            },
        }]);
        let candidates = parse_candidates(&result, 1);
        assert_eq!(candidates.len(), 1);
        // The edit is unrepresentable in editor space; the candidate falls
        // back to inserting at the cursor.
        assert_eq!(candidates[0].edit, None);
        assert_eq!(candidates[0].insert_text, "declare");
    }

    #[test]
    fn test_insert_replace_edit_uses_replace_range() {
        let result = json!([{
            "label": "strlen",
            "textEdit": {
                "insert": {
                    "start": {"line": 1, "character": 0},
                    "end": {"line": 1, "character": 3},
                },
                "replace": {
                    "start": {"line": 1, "character": 0},
                    "end": {"line": 1, "character": 6},
                },
                "newText": "strlen",
            },
        }]);
        let candidates = parse_candidates(&result, 1);
        let edit = candidates[0].edit.as_ref().unwrap();
        assert_eq!(edit.range, range(0, 0, 0, 6));
    }

    #[test]
    fn test_snippet_insert_text_is_resolved() {
        let result = json!([{
            "label": "str_replace",
            "insertText": "str_replace(${1:search}, ${2:replace}, ${3:subject})$0",
            "insertTextFormat": 2,
        }]);
        let candidates = parse_candidates(&result, 0);
        assert_eq!(
            candidates[0].insert_text,
            "str_replace(search, replace, subject)"
        );
        assert_eq!(
            candidates[0].selection,
            Some(Selection { start: 12, len: 6 })
        );
    }

    #[test]
    fn test_plain_insert_text_is_untouched() {
        let result = json!([{
            "label": "strlen",
            "insertText": "strlen($1)",
            "insertTextFormat": 1,
        }]);
        let candidates = parse_candidates(&result, 0);
        assert_eq!(candidates[0].insert_text, "strlen($1)");
        assert_eq!(candidates[0].selection, None);
    }

    #[test]
    fn test_insert_text_falls_back_to_label() {
        let result = json!([{"label": "array_map"}]);
        assert_eq!(parse_candidates(&result, 0)[0].insert_text, "array_map");
    }

    #[test]
    fn test_additional_edits_remap_and_drop_negative() {
        let result = json!([{
            "label": "User",
            "additionalTextEdits": [
                {
                    "range": {
                        "start": {"line": 1, "character": 0},
                        "end": {"line": 1, "character": 0},
                    },
                    "newText": "use App\\Models\\User;\n",
                },
                {
                    "range": {
                        "start": {"line": 0, "character": 0},
                        "end": {"line": 0, "character": 0},
                    },
                    "newText": "on the synthetic line",
                },
            ],
        }]);
        let candidates = parse_candidates(&result, 1);
        assert_eq!(candidates[0].additional_edits.len(), 1);
        assert_eq!(candidates[0].additional_edits[0].range, range(0, 0, 0, 0));
    }

    #[test]
    fn test_documentation_shapes() {
        assert_eq!(
            documentation_text(&json!("plain docs")),
            Some("plain docs".to_string())
        );
        assert_eq!(
            documentation_text(&json!({"kind": "markdown", "value": "**docs**"})),
            Some("**docs**".to_string())
        );
        assert_eq!(documentation_text(&json!(42)), None);
    }

    #[test]
    fn test_raw_item_is_preserved_for_resolve() {
        let item = json!({"label": "strlen", "data": {"server": "opaque"}});
        let candidates = parse_candidates(&json!([item.clone()]), 0);
        assert_eq!(candidates[0].raw, item);
    }
}
