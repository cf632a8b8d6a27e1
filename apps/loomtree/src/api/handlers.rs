//! # API Endpoint Handlers
//!
//! This module implements the actual HTTP endpoint handlers.
//!
//! Every handler maps engine errors through [`ApiError`], so the status code
//! and body shape depend only on the error variant.

use super::{
    AppState,
    types::{
        ActiveNodeQuery, ActiveNodeResponse, AnnotateRequest, AppendResponse, AuditResponse,
        CompletionRequest, CreatePathRequest, CreateTreeRequest, CreateTreeResponse, EditRequest,
        ErrorResponse, EvidenceJson, ExportResponse, GenerateRequest, HealthResponse,
        ImportRequest, MessageRequest, MoveRequest, NodeJson, NodeViewResponse, PathNodesResponse,
        PathResponse, RevisionResponse, SelectRequest, StatusResponse, TruncateRequest,
        nodes_json,
    },
};
use crate::provider::generate_with_retry;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use loomtree_core::{
    AuditReport, Completion, LoomError, LoomTree, MetadataPatch, NewTree, NodeId, PathId,
    PathSelection, Preferences, PreferencesPatch, ProviderError, TreeDetailsPatch, TreeId,
    VerificationResult,
};

// =============================================================================
// ERROR MAPPING
// =============================================================================

/// Error returned by handlers.
#[derive(Debug)]
pub enum ApiError {
    Loom(LoomError),
    Provider(ProviderError),
}

impl From<LoomError> for ApiError {
    fn from(err: LoomError) -> Self {
        Self::Loom(err)
    }
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        Self::Provider(err)
    }
}

/// HTTP status for an engine error.
pub fn status_for(err: &LoomError) -> StatusCode {
    match err {
        LoomError::NotFound { .. } => StatusCode::NOT_FOUND,
        LoomError::Validation(_) => StatusCode::BAD_REQUEST,
        LoomError::Conflict(_) | LoomError::SelectionRequired { .. } => StatusCode::CONFLICT,
        LoomError::Unverifiable { .. } | LoomError::HashMismatch { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        LoomError::IdExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        LoomError::InvalidState(_) | LoomError::SerializationError(_) | LoomError::IoError(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Loom(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    tracing::error!(code = err.code(), "request failed: {}", err);
                } else {
                    tracing::debug!(code = err.code(), "request rejected: {}", err);
                }
                (status, Json(ErrorResponse::from_loom(&err))).into_response()
            }
            Self::Provider(err) => {
                let body = ErrorResponse {
                    success: false,
                    code: format!("provider_{}", err.code.as_str()),
                    error: err.to_string(),
                    recoverable: false,
                    candidates: Vec::new(),
                    retryable: Some(err.retryable),
                    retry_after_ms: err.retry_after_ms,
                };
                (StatusCode::BAD_GATEWAY, Json(body)).into_response()
            }
        }
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

// =============================================================================
// HEALTH / STATUS
// =============================================================================

/// Health check endpoint.
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse::default())
}

/// Store status.
pub async fn status_handler(State(state): State<AppState>) -> ApiResult<StatusResponse> {
    let session = state.session.read().await;
    Ok(Json(StatusResponse {
        persistent: session.is_persistent(),
        tree_count: session.trees()?.len(),
        revision: session.revision()?,
    }))
}

/// Committed-transaction counter.
pub async fn revision_handler(State(state): State<AppState>) -> ApiResult<RevisionResponse> {
    let session = state.session.read().await;
    Ok(Json(RevisionResponse {
        revision: session.revision()?,
    }))
}

// =============================================================================
// PREFERENCES
// =============================================================================

pub async fn get_preferences_handler(State(state): State<AppState>) -> ApiResult<Preferences> {
    // First access creates the record, so this needs the write lock.
    let mut session = state.session.write().await;
    Ok(Json(session.preferences()?))
}

pub async fn update_preferences_handler(
    State(state): State<AppState>,
    Json(patch): Json<PreferencesPatch>,
) -> ApiResult<Preferences> {
    let mut session = state.session.write().await;
    Ok(Json(session.update_preferences(&patch)?))
}

// =============================================================================
// TREES
// =============================================================================

pub async fn create_tree_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateTreeRequest>,
) -> Result<(StatusCode, Json<CreateTreeResponse>), ApiError> {
    let mut session = state.session.write().await;
    let prefs = session.preferences()?;
    let owner = request
        .create_path
        .then(|| (request.author, request.path_name.clone()));

    let (tree, root, path) = session.create_tree(
        NewTree {
            container_id: request.container_id.unwrap_or(prefs.default_container_id),
            mode: request.mode.unwrap_or(prefs.default_mode),
            system_context: request.system_context,
            title: request.title,
            description: request.description,
            root_content: request.root,
            root_author: request.author,
        },
        owner,
    )?;

    Ok((
        StatusCode::CREATED,
        Json(CreateTreeResponse {
            tree,
            root: root.node.into(),
            path,
        }),
    ))
}

pub async fn list_trees_handler(State(state): State<AppState>) -> ApiResult<Vec<LoomTree>> {
    let session = state.session.read().await;
    Ok(Json(session.trees()?))
}

pub async fn get_tree_handler(
    State(state): State<AppState>,
    Path(tree_id): Path<TreeId>,
) -> ApiResult<LoomTree> {
    let session = state.session.read().await;
    Ok(Json(session.tree(tree_id)?))
}

pub async fn update_tree_handler(
    State(state): State<AppState>,
    Path(tree_id): Path<TreeId>,
    Json(patch): Json<TreeDetailsPatch>,
) -> ApiResult<LoomTree> {
    let mut session = state.session.write().await;
    Ok(Json(session.update_tree(tree_id, &patch)?))
}

/// Soft delete: the tree stays readable but rejects writes.
pub async fn delete_tree_handler(
    State(state): State<AppState>,
    Path(tree_id): Path<TreeId>,
) -> ApiResult<LoomTree> {
    let mut session = state.session.write().await;
    Ok(Json(session.soft_delete_tree(tree_id)?))
}

pub async fn tree_nodes_handler(
    State(state): State<AppState>,
    Path(tree_id): Path<TreeId>,
) -> ApiResult<Vec<NodeJson>> {
    let session = state.session.read().await;
    Ok(Json(nodes_json(session.tree_nodes(tree_id)?)))
}

pub async fn tree_root_handler(
    State(state): State<AppState>,
    Path(tree_id): Path<TreeId>,
) -> ApiResult<NodeJson> {
    let session = state.session.read().await;
    Ok(Json(session.root(tree_id)?.into()))
}

pub async fn bookmarks_handler(
    State(state): State<AppState>,
    Path(tree_id): Path<TreeId>,
) -> ApiResult<Vec<NodeJson>> {
    let session = state.session.read().await;
    Ok(Json(nodes_json(session.bookmarks(tree_id)?)))
}

pub async fn tree_paths_handler(
    State(state): State<AppState>,
    Path(tree_id): Path<TreeId>,
) -> ApiResult<Vec<loomtree_core::Path>> {
    let session = state.session.read().await;
    Ok(Json(session.tree_paths(tree_id)?))
}

/// Verify every node of a tree.
pub async fn audit_handler(
    State(state): State<AppState>,
    Path(tree_id): Path<TreeId>,
) -> ApiResult<AuditResponse> {
    let session = state.session.read().await;
    let report: AuditReport = session.audit(tree_id)?;
    Ok(Json(AuditResponse {
        clean: report.is_clean(),
        report,
    }))
}

/// Export a tree in the canonical binary format.
pub async fn export_handler(
    State(state): State<AppState>,
    Path(tree_id): Path<TreeId>,
) -> ApiResult<ExportResponse> {
    let session = state.session.read().await;
    let data = session.export_tree(tree_id)?;
    let digest = session.tree_digest(tree_id)?;
    Ok(Json(ExportResponse::new(tree_id, &data, digest)))
}

pub async fn import_handler(
    State(state): State<AppState>,
    Json(request): Json<ImportRequest>,
) -> Result<(StatusCode, Json<LoomTree>), ApiError> {
    let data = request.decode()?;
    let mut session = state.session.write().await;
    let tree = session.import_tree(&data)?;
    Ok((StatusCode::CREATED, Json(tree)))
}

// =============================================================================
// NODES
// =============================================================================

pub async fn get_node_handler(
    State(state): State<AppState>,
    Path(node_id): Path<NodeId>,
) -> ApiResult<NodeViewResponse> {
    let session = state.session.read().await;
    Ok(Json(session.node_view(node_id)?.into()))
}

pub async fn update_metadata_handler(
    State(state): State<AppState>,
    Path(node_id): Path<NodeId>,
    Json(patch): Json<MetadataPatch>,
) -> ApiResult<NodeJson> {
    let mut session = state.session.write().await;
    Ok(Json(session.update_metadata(node_id, &patch)?.into()))
}

pub async fn annotate_handler(
    State(state): State<AppState>,
    Path(node_id): Path<NodeId>,
    Json(request): Json<AnnotateRequest>,
) -> Result<(StatusCode, Json<NodeJson>), ApiError> {
    let mut session = state.session.write().await;
    let created = session.annotate(node_id, request.author, request.content)?;
    Ok((StatusCode::CREATED, Json(created.node.into())))
}

pub async fn verify_handler(
    State(state): State<AppState>,
    Path(node_id): Path<NodeId>,
) -> ApiResult<VerificationResult> {
    let session = state.session.read().await;
    Ok(Json(session.verify(node_id)?))
}

/// Verify a node and every ancestor on its primary chain.
pub async fn verify_chain_handler(
    State(state): State<AppState>,
    Path(node_id): Path<NodeId>,
) -> ApiResult<Vec<VerificationResult>> {
    let session = state.session.read().await;
    Ok(Json(session.verify_chain(node_id)?))
}

pub async fn versions_handler(
    State(state): State<AppState>,
    Path(node_id): Path<NodeId>,
) -> ApiResult<Vec<NodeJson>> {
    let session = state.session.read().await;
    Ok(Json(nodes_json(session.versions(node_id)?)))
}

pub async fn lineage_handler(
    State(state): State<AppState>,
    Path(node_id): Path<NodeId>,
) -> ApiResult<Vec<NodeJson>> {
    let session = state.session.read().await;
    Ok(Json(nodes_json(session.lineage(node_id)?)))
}

pub async fn evidence_handler(
    State(state): State<AppState>,
    Path(node_id): Path<NodeId>,
) -> ApiResult<EvidenceJson> {
    let session = state.session.read().await;
    let evidence = session
        .read(|r| r.evidence(node_id))?
        .ok_or_else(|| LoomError::not_found("evidence", node_id))?;
    Ok(Json(evidence.into()))
}

// =============================================================================
// PATHS
// =============================================================================

pub async fn create_path_handler(
    State(state): State<AppState>,
    Path(tree_id): Path<TreeId>,
    Json(request): Json<CreatePathRequest>,
) -> Result<(StatusCode, Json<PathResponse>), ApiError> {
    let mut session = state.session.write().await;
    let path = session.create_path(tree_id, request.owner, request.name)?;
    let nodes = session.path_nodes(path.id)?;
    Ok((
        StatusCode::CREATED,
        Json(PathResponse {
            path,
            nodes,
            selections: Vec::new(),
        }),
    ))
}

pub async fn get_path_handler(
    State(state): State<AppState>,
    Path(path_id): Path<PathId>,
) -> ApiResult<PathResponse> {
    let session = state.session.read().await;
    Ok(Json(PathResponse {
        path: session.path(path_id)?,
        nodes: session.path_nodes(path_id)?,
        selections: session.selections(path_id)?,
    }))
}

pub async fn delete_path_handler(
    State(state): State<AppState>,
    Path(path_id): Path<PathId>,
) -> ApiResult<loomtree_core::Path> {
    let mut session = state.session.write().await;
    Ok(Json(session.delete_path(path_id)?))
}

fn moved(path_id: PathId, nodes: Vec<NodeId>) -> ApiResult<PathNodesResponse> {
    Ok(Json(PathNodesResponse { path_id, nodes }))
}

pub async fn advance_handler(
    State(state): State<AppState>,
    Path(path_id): Path<PathId>,
    Json(request): Json<MoveRequest>,
) -> ApiResult<PathNodesResponse> {
    let mut session = state.session.write().await;
    let nodes = session.advance(path_id, request.agent, request.node_id)?;
    moved(path_id, nodes)
}

pub async fn navigate_handler(
    State(state): State<AppState>,
    Path(path_id): Path<PathId>,
    Json(request): Json<MoveRequest>,
) -> ApiResult<PathNodesResponse> {
    let mut session = state.session.write().await;
    let nodes = session.navigate(path_id, request.agent, request.node_id)?;
    moved(path_id, nodes)
}

pub async fn truncate_handler(
    State(state): State<AppState>,
    Path(path_id): Path<PathId>,
    Json(request): Json<TruncateRequest>,
) -> ApiResult<PathNodesResponse> {
    let mut session = state.session.write().await;
    let nodes = session.truncate(path_id, request.len)?;
    moved(path_id, nodes)
}

pub async fn select_handler(
    State(state): State<AppState>,
    Path(path_id): Path<PathId>,
    Json(request): Json<SelectRequest>,
) -> ApiResult<PathSelection> {
    let mut session = state.session.write().await;
    Ok(Json(session.select(
        path_id,
        request.target_node_id,
        request.selected_edge_id,
        request.selected_source_node_id,
    )?))
}

pub async fn clear_selection_handler(
    State(state): State<AppState>,
    Path((path_id, target)): Path<(PathId, NodeId)>,
) -> Result<StatusCode, ApiError> {
    let mut session = state.session.write().await;
    if session.clear_selection(path_id, target)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(LoomError::not_found("selection", target).into())
    }
}

pub async fn active_node_handler(
    State(state): State<AppState>,
    Path(path_id): Path<PathId>,
    Query(query): Query<ActiveNodeQuery>,
) -> ApiResult<ActiveNodeResponse> {
    let session = state.session.read().await;
    Ok(Json(ActiveNodeResponse {
        state: session.active_node(path_id, query.agent, query.mode)?,
    }))
}

// =============================================================================
// WRITING THROUGH A PATH
// =============================================================================

pub async fn message_handler(
    State(state): State<AppState>,
    Path(path_id): Path<PathId>,
    Json(request): Json<MessageRequest>,
) -> Result<(StatusCode, Json<AppendResponse>), ApiError> {
    let mut session = state.session.write().await;
    let appended = session.append_human(path_id, request.agent, request.content)?;
    let created = appended.result;
    Ok((
        StatusCode::CREATED,
        Json(AppendResponse {
            node: created.node.into(),
            edge_ids: created.edges.iter().map(|e| e.id).collect(),
            short_id_degraded: created.short_id_degraded,
            path_len: appended.path_len,
            evidence: None,
            extended_edges: Vec::new(),
        }),
    ))
}

pub async fn context_handler(
    State(state): State<AppState>,
    Path(path_id): Path<PathId>,
) -> ApiResult<loomtree_core::AssembledContext> {
    let session = state.session.read().await;
    Ok(Json(session.context(path_id)?))
}

/// Continue the path with the configured provider.
///
/// The lock is released while the provider runs; if the path moves in the
/// meantime the completion is discarded with `409 Conflict`.
pub async fn generate_handler(
    State(state): State<AppState>,
    Path(path_id): Path<PathId>,
    request: Option<Json<GenerateRequest>>,
) -> Result<(StatusCode, Json<AppendResponse>), ApiError> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let agent = match request.agent {
        Some(agent) => agent,
        None => state.config.generation.model_agent_id.ok_or_else(|| {
            LoomError::Validation("no agent given and no model agent configured".to_string())
        })?,
    };

    let context = {
        let session = state.session.read().await;
        session.context(path_id)?
    };

    let completion = generate_with_retry(
        state.provider.as_ref(),
        &context,
        &state.config.generation.retry,
    )
    .await?;

    let mut session = state.session.write().await;
    record(
        &mut session,
        &context,
        agent,
        completion,
        state.config.generation.keep_raw_bytes,
    )
}

/// Record a completion produced by the client.
pub async fn completion_handler(
    State(state): State<AppState>,
    Path(path_id): Path<PathId>,
    Json(request): Json<CompletionRequest>,
) -> Result<(StatusCode, Json<AppendResponse>), ApiError> {
    let raw_response = request.raw_response.decode()?;
    let mut session = state.session.write().await;
    let context = session.context(path_id)?;
    if request
        .expected_tail
        .is_some_and(|expected| context.tail() != Some(expected))
    {
        return Err(LoomError::Conflict(format!(
            "path {} no longer ends at the expected node",
            path_id
        ))
        .into());
    }

    record(
        &mut session,
        &context,
        request.agent,
        Completion {
            content: request.content,
            raw_response,
            provider: request.provider,
            provider_request_id: request.provider_request_id,
            model_identifier: request.model_identifier,
            token_usage: request.token_usage,
        },
        state.config.generation.keep_raw_bytes,
    )
}

fn record(
    session: &mut loomtree_core::Session,
    context: &loomtree_core::AssembledContext,
    agent: loomtree_core::AgentId,
    completion: Completion,
    keep_raw_bytes: bool,
) -> Result<(StatusCode, Json<AppendResponse>), ApiError> {
    let appended = session.append_completion(context, agent, completion, keep_raw_bytes)?;
    let generated = appended.result;
    Ok((
        StatusCode::CREATED,
        Json(AppendResponse {
            node: generated.created.node.into(),
            edge_ids: generated.created.edges.iter().map(|e| e.id).collect(),
            short_id_degraded: generated.created.short_id_degraded,
            path_len: appended.path_len,
            evidence: Some(generated.evidence.into()),
            extended_edges: Vec::new(),
        }),
    ))
}

/// Edit a node on a buffer-mode path.
pub async fn edit_handler(
    State(state): State<AppState>,
    Path(path_id): Path<PathId>,
    Json(request): Json<EditRequest>,
) -> Result<(StatusCode, Json<AppendResponse>), ApiError> {
    let mut session = state.session.write().await;
    let appended = session.edit(path_id, request.agent, request.node_id, request.content)?;
    let outcome = appended.result;
    Ok((
        StatusCode::CREATED,
        Json(AppendResponse {
            node: outcome.created.node.into(),
            edge_ids: outcome.created.edges.iter().map(|e| e.id).collect(),
            short_id_degraded: outcome.created.short_id_degraded,
            path_len: appended.path_len,
            evidence: None,
            extended_edges: outcome.extended_edges,
        }),
    ))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&LoomError::not_found("node", "x")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&LoomError::Validation("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&LoomError::Conflict("taken".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&LoomError::InvalidState("two roots".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
