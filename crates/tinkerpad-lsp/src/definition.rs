//! Go-to-definition lookups against the scratch document.

use crate::document::DocumentStore;
use crate::position;
use crate::server::ServerManager;
use lsp_types::{
    GotoDefinitionParams, Location, PartialResultParams, TextDocumentIdentifier,
    TextDocumentPositionParams, WorkDoneProgressParams,
};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

const DEFINITION_TIMEOUT: Duration = Duration::from_secs(2);

/// Look up definitions for the symbol at the cursor.
///
/// Locations inside the scratch document itself are shifted back into editor
/// coordinates; a location on the synthetic first line is dropped. Failures
/// yield an empty list.
pub async fn definitions(
    server: &mut ServerManager,
    documents: &mut DocumentStore,
    uri: &str,
    root: &Path,
    text: &str,
    offset: usize,
) -> Vec<Location> {
    match lookup(server, documents, uri, root, text, offset).await {
        Ok(locations) => locations,
        Err(e) => {
            warn!(error = %e, "Definition lookup failed");
            Vec::new()
        }
    }
}

async fn lookup(
    server: &mut ServerManager,
    documents: &mut DocumentStore,
    uri: &str,
    root: &Path,
    text: &str,
    offset: usize,
) -> crate::error::LspResult<Vec<Location>> {
    let transport = server.ensure(root, documents).await?;
    let line_offset = documents.open_or_update(&transport, uri, text).await?;

    let mut protocol_position = position::position_at(text, offset);
    protocol_position.line += line_offset;

    let params = GotoDefinitionParams {
        text_document_position_params: TextDocumentPositionParams {
            text_document: TextDocumentIdentifier {
                uri: uri
                    .parse()
                    .map_err(|e| crate::error::LspError::InvalidUri(format!("{uri}: {e}")))?,
            },
            position: protocol_position,
        },
        work_done_progress_params: WorkDoneProgressParams::default(),
        partial_result_params: PartialResultParams::default(),
    };

    let result = transport
        .request(
            "textDocument/definition",
            Some(serde_json::to_value(params)?),
            DEFINITION_TIMEOUT,
        )
        .await?;

    Ok(parse_locations(&result, uri, line_offset))
}

/// Normalize the definition response. Servers answer with a single
/// `Location`, an array of them, or an array of `LocationLink`s.
fn parse_locations(result: &Value, document_uri: &str, line_offset: u32) -> Vec<Location> {
    let raw: Vec<Location> = if let Ok(location) =
        serde_json::from_value::<Location>(result.clone())
    {
        vec![location]
    } else if let Ok(locations) = serde_json::from_value::<Vec<Location>>(result.clone()) {
        locations
    } else if let Some(links) = result.as_array() {
        links
            .iter()
            .filter_map(|link| {
                let uri = link.get("targetUri")?;
                let range = link
                    .get("targetSelectionRange")
                    .or_else(|| link.get("targetRange"))?;
                serde_json::from_value(serde_json::json!({
                    "uri": uri,
                    "range": range,
                }))
                .ok()
            })
            .collect()
    } else {
        debug!(%result, "Unrecognized definition response shape");
        Vec::new()
    };

    raw.into_iter()
        .filter_map(|mut location| {
            if location.uri.as_str() == document_uri {
                location.range =
                    crate::completion::remap_range(location.range, line_offset)?;
            }
            Some(location)
        })
        .collect()
}
