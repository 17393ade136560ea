//! Minimal admin HTTP API.
//!
//! The mutation surface over controller state: enrollment tokens, the
//! relational policy data the compiler reads (users, groups, membership,
//! remote networks, access rules and their group links — full
//! list/get/update/delete for each), resources and authorization edges
//! (each mutation persists, updates the in-memory store, and broadcasts
//! the matching delta), tunneler admission, connector removal, and audit
//! inspection. Bind-local by default; this is an operator surface, not a
//! fleet-facing one.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use ztna_proto::message::{AclFilter, AclResource};
use ztna_proto::snapshot::normalize_resource_type;

use crate::control_plane::ControlPlane;
use crate::state::db::ResourceRow;

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

pub fn router(cp: Arc<ControlPlane>) -> Router {
    Router::new()
        .route("/api/tokens", post(mint_token))
        .route("/api/users", get(list_users).post(upsert_user))
        .route(
            "/api/users/{id}",
            get(get_user)
                .put(update_user)
                .patch(update_user)
                .delete(delete_user),
        )
        .route("/api/groups", get(list_groups).post(upsert_group))
        .route(
            "/api/groups/{id}",
            get(get_group)
                .put(update_group)
                .patch(update_group)
                .delete(delete_group),
        )
        .route(
            "/api/groups/{id}/members",
            get(list_members).post(add_member).delete(remove_member),
        )
        .route("/api/networks", get(list_networks).post(upsert_network))
        .route(
            "/api/networks/{id}",
            get(get_network)
                .put(update_network)
                .patch(update_network)
                .delete(delete_network),
        )
        .route("/api/networks/{id}/connectors", get(list_network_connectors))
        .route("/api/connectors", get(list_connectors))
        .route("/api/connectors/{id}", delete(delete_connector))
        .route(
            "/api/connectors/{id}/network",
            post(assign_network).delete(unassign_network),
        )
        .route("/api/connectors/{id}/compile", post(compile_snapshot))
        .route("/api/access-rules", get(list_rules).post(upsert_rule))
        .route(
            "/api/access-rules/{id}",
            get(get_rule)
                .put(update_rule)
                .patch(update_rule)
                .delete(delete_rule),
        )
        .route("/api/access-rules/{id}/groups", post(link_rule_group))
        .route(
            "/api/access-rules/{id}/groups/{group_id}",
            delete(unlink_rule_group),
        )
        .route("/api/resources", post(upsert_resource))
        .route("/api/resources/{id}", delete(remove_resource))
        .route("/api/authorizations", post(assign_authorization))
        .route(
            "/api/authorizations/{resource_id}/{principal}",
            delete(remove_authorization),
        )
        .route("/api/tunnelers", get(list_tunnelers).post(admit_tunneler))
        .route("/api/resync", post(resync))
        .route("/api/acl", get(acl_state))
        .route("/api/audit", get(list_audit))
        .with_state(cp)
}

fn bad_request(message: impl ToString) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.to_string() })),
    )
}

fn not_found(message: impl ToString) -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": message.to_string() })),
    )
}

fn internal(message: impl ToString) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message.to_string() })),
    )
}

async fn mint_token(State(cp): State<Arc<ControlPlane>>) -> ApiResult {
    let (token, expires_at) = cp.tokens.mint().map_err(internal)?;
    Ok(Json(json!({ "token": token, "expires_at": expires_at })))
}

// ── Users ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct UserBody {
    id: String,
    name: String,
    email: String,
    certificate_identity: Option<String>,
}

async fn upsert_user(State(cp): State<Arc<ControlPlane>>, Json(body): Json<UserBody>) -> ApiResult {
    cp.db
        .save_user(
            &body.id,
            &body.name,
            &body.email,
            body.certificate_identity.as_deref(),
        )
        .map_err(bad_request)?;
    Ok(Json(json!({ "ok": true })))
}

async fn list_users(State(cp): State<Arc<ControlPlane>>) -> ApiResult {
    let users = cp.db.list_users().map_err(internal)?;
    Ok(Json(json!({ "users": users })))
}

async fn get_user(State(cp): State<Arc<ControlPlane>>, Path(id): Path<String>) -> ApiResult {
    let user = cp
        .db
        .get_user(&id)
        .map_err(internal)?
        .ok_or_else(|| not_found("user not found"))?;
    Ok(Json(json!({ "user": user })))
}

#[derive(Deserialize)]
struct UserUpdateBody {
    name: Option<String>,
    email: Option<String>,
    certificate_identity: Option<String>,
    status: Option<String>,
}

/// Partial update: absent fields keep their current value.
async fn update_user(
    State(cp): State<Arc<ControlPlane>>,
    Path(id): Path<String>,
    Json(body): Json<UserUpdateBody>,
) -> ApiResult {
    let mut user = cp
        .db
        .get_user(&id)
        .map_err(internal)?
        .ok_or_else(|| not_found("user not found"))?;
    if let Some(name) = body.name {
        user.name = name;
    }
    if let Some(email) = body.email {
        user.email = email;
    }
    if let Some(identity) = body.certificate_identity {
        user.certificate_identity = Some(identity).filter(|s| !s.is_empty());
    }
    if let Some(status) = body.status {
        user.status = status;
    }
    cp.db.update_user(&user).map_err(bad_request)?;
    Ok(Json(json!({ "user": user })))
}

async fn delete_user(State(cp): State<Arc<ControlPlane>>, Path(id): Path<String>) -> ApiResult {
    cp.db.delete_user(&id).map_err(internal)?;
    Ok(Json(json!({ "ok": true })))
}

// ── Groups & membership ────────────────────────────────────────────────

#[derive(Deserialize)]
struct NamedBody {
    id: String,
    name: String,
}

async fn upsert_group(State(cp): State<Arc<ControlPlane>>, Json(body): Json<NamedBody>) -> ApiResult {
    cp.db.save_group(&body.id, &body.name).map_err(bad_request)?;
    Ok(Json(json!({ "ok": true })))
}

async fn list_groups(State(cp): State<Arc<ControlPlane>>) -> ApiResult {
    let groups = cp.db.list_groups().map_err(internal)?;
    Ok(Json(json!({ "groups": groups })))
}

async fn get_group(State(cp): State<Arc<ControlPlane>>, Path(id): Path<String>) -> ApiResult {
    let group = cp
        .db
        .get_group(&id)
        .map_err(internal)?
        .ok_or_else(|| not_found("group not found"))?;
    Ok(Json(json!({ "group": group })))
}

#[derive(Deserialize)]
struct RenameBody {
    name: Option<String>,
}

async fn update_group(
    State(cp): State<Arc<ControlPlane>>,
    Path(id): Path<String>,
    Json(body): Json<RenameBody>,
) -> ApiResult {
    let group = cp
        .db
        .get_group(&id)
        .map_err(internal)?
        .ok_or_else(|| not_found("group not found"))?;
    let name = body.name.unwrap_or(group.name);
    cp.db.save_group(&id, &name).map_err(bad_request)?;
    Ok(Json(json!({ "ok": true })))
}

async fn delete_group(State(cp): State<Arc<ControlPlane>>, Path(id): Path<String>) -> ApiResult {
    cp.db.delete_group(&id).map_err(internal)?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
struct MemberBody {
    user_id: String,
}

async fn add_member(
    State(cp): State<Arc<ControlPlane>>,
    Path(group_id): Path<String>,
    Json(body): Json<MemberBody>,
) -> ApiResult {
    cp.db
        .add_group_member(&group_id, &body.user_id)
        .map_err(bad_request)?;
    Ok(Json(json!({ "ok": true })))
}

async fn list_members(
    State(cp): State<Arc<ControlPlane>>,
    Path(group_id): Path<String>,
) -> ApiResult {
    let members = cp.db.list_group_members(&group_id).map_err(internal)?;
    Ok(Json(json!({ "members": members })))
}

async fn remove_member(
    State(cp): State<Arc<ControlPlane>>,
    Path(group_id): Path<String>,
    Json(body): Json<MemberBody>,
) -> ApiResult {
    cp.db
        .remove_group_member(&group_id, &body.user_id)
        .map_err(internal)?;
    Ok(Json(json!({ "ok": true })))
}

// ── Remote networks ────────────────────────────────────────────────────

async fn upsert_network(
    State(cp): State<Arc<ControlPlane>>,
    Json(body): Json<NamedBody>,
) -> ApiResult {
    cp.db
        .save_remote_network(&body.id, &body.name)
        .map_err(bad_request)?;
    Ok(Json(json!({ "ok": true })))
}

async fn list_networks(State(cp): State<Arc<ControlPlane>>) -> ApiResult {
    let networks = cp.db.list_remote_networks().map_err(internal)?;
    Ok(Json(json!({ "networks": networks })))
}

async fn get_network(State(cp): State<Arc<ControlPlane>>, Path(id): Path<String>) -> ApiResult {
    let network = cp
        .db
        .get_remote_network(&id)
        .map_err(internal)?
        .ok_or_else(|| not_found("network not found"))?;
    Ok(Json(json!({ "network": network })))
}

async fn update_network(
    State(cp): State<Arc<ControlPlane>>,
    Path(id): Path<String>,
    Json(body): Json<RenameBody>,
) -> ApiResult {
    let network = cp
        .db
        .get_remote_network(&id)
        .map_err(internal)?
        .ok_or_else(|| not_found("network not found"))?;
    let name = body.name.unwrap_or(network.name);
    cp.db.save_remote_network(&id, &name).map_err(bad_request)?;
    Ok(Json(json!({ "ok": true })))
}

async fn delete_network(State(cp): State<Arc<ControlPlane>>, Path(id): Path<String>) -> ApiResult {
    cp.db.delete_remote_network(&id).map_err(internal)?;
    Ok(Json(json!({ "ok": true })))
}

async fn list_network_connectors(
    State(cp): State<Arc<ControlPlane>>,
    Path(id): Path<String>,
) -> ApiResult {
    let connectors = cp.db.list_network_connectors(&id).map_err(internal)?;
    Ok(Json(json!({ "connectors": connectors })))
}

// ── Connectors ─────────────────────────────────────────────────────────

async fn list_connectors(State(cp): State<Arc<ControlPlane>>) -> Json<Value> {
    Json(json!({ "connectors": cp.connectors.list() }))
}

/// Remove a connector: registry record, persisted row and policy-version
/// bookkeeping, and every enrollment token bound to it.
async fn delete_connector(
    State(cp): State<Arc<ControlPlane>>,
    Path(id): Path<String>,
) -> ApiResult {
    cp.connectors.delete(&id);
    cp.db.delete_connector(&id).map_err(internal)?;
    cp.tokens.revoke_for_connector(&id).map_err(internal)?;
    info!(connector_id = %id, "connector removed");
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
struct NetworkAssignBody {
    remote_network_id: String,
}

async fn assign_network(
    State(cp): State<Arc<ControlPlane>>,
    Path(connector_id): Path<String>,
    Json(body): Json<NetworkAssignBody>,
) -> ApiResult {
    cp.db
        .assign_connector_network(&connector_id, &body.remote_network_id)
        .map_err(bad_request)?;
    Ok(Json(json!({ "ok": true })))
}

async fn unassign_network(
    State(cp): State<Arc<ControlPlane>>,
    Path(connector_id): Path<String>,
) -> ApiResult {
    cp.db
        .remove_connector_network(&connector_id)
        .map_err(internal)?;
    Ok(Json(json!({ "ok": true })))
}

async fn compile_snapshot(
    State(cp): State<Arc<ControlPlane>>,
    Path(connector_id): Path<String>,
) -> ApiResult {
    let snapshot = cp.compile_snapshot(&connector_id).map_err(bad_request)?;
    Ok(Json(json!({ "snapshot": snapshot })))
}

// ── Access rules ───────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RuleBody {
    id: String,
    name: String,
    resource_id: String,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    group_ids: Vec<String>,
}

fn default_true() -> bool {
    true
}

async fn upsert_rule(State(cp): State<Arc<ControlPlane>>, Json(body): Json<RuleBody>) -> ApiResult {
    cp.db
        .save_access_rule(&body.id, &body.name, &body.resource_id, body.enabled)
        .map_err(bad_request)?;
    for group_id in &body.group_ids {
        cp.db.add_rule_group(&body.id, group_id).map_err(bad_request)?;
    }
    Ok(Json(json!({ "ok": true })))
}

async fn list_rules(State(cp): State<Arc<ControlPlane>>) -> ApiResult {
    let rules = cp.db.list_access_rules().map_err(internal)?;
    Ok(Json(json!({ "rules": rules })))
}

async fn get_rule(State(cp): State<Arc<ControlPlane>>, Path(id): Path<String>) -> ApiResult {
    let rule = cp
        .db
        .get_access_rule(&id)
        .map_err(internal)?
        .ok_or_else(|| not_found("access rule not found"))?;
    Ok(Json(json!({ "rule": rule })))
}

#[derive(Deserialize)]
struct RuleUpdateBody {
    name: Option<String>,
    resource_id: Option<String>,
    enabled: Option<bool>,
    group_ids: Option<Vec<String>>,
}

/// Partial update; when `group_ids` is present the link set is replaced.
async fn update_rule(
    State(cp): State<Arc<ControlPlane>>,
    Path(id): Path<String>,
    Json(body): Json<RuleUpdateBody>,
) -> ApiResult {
    let rule = cp
        .db
        .get_access_rule(&id)
        .map_err(internal)?
        .ok_or_else(|| not_found("access rule not found"))?;
    let name = body.name.unwrap_or(rule.name);
    let resource_id = body.resource_id.unwrap_or(rule.resource_id);
    let enabled = body.enabled.unwrap_or(rule.enabled);
    cp.db
        .save_access_rule(&id, &name, &resource_id, enabled)
        .map_err(bad_request)?;
    if let Some(group_ids) = body.group_ids {
        for group_id in &rule.group_ids {
            cp.db.remove_rule_group(&id, group_id).map_err(internal)?;
        }
        for group_id in &group_ids {
            cp.db.add_rule_group(&id, group_id).map_err(bad_request)?;
        }
    }
    Ok(Json(json!({ "ok": true })))
}

async fn delete_rule(State(cp): State<Arc<ControlPlane>>, Path(id): Path<String>) -> ApiResult {
    cp.db.delete_access_rule(&id).map_err(internal)?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
struct RuleGroupBody {
    group_id: String,
}

async fn link_rule_group(
    State(cp): State<Arc<ControlPlane>>,
    Path(rule_id): Path<String>,
    Json(body): Json<RuleGroupBody>,
) -> ApiResult {
    cp.db
        .add_rule_group(&rule_id, &body.group_id)
        .map_err(bad_request)?;
    Ok(Json(json!({ "ok": true })))
}

async fn unlink_rule_group(
    State(cp): State<Arc<ControlPlane>>,
    Path((rule_id, group_id)): Path<(String, String)>,
) -> ApiResult {
    cp.db
        .remove_rule_group(&rule_id, &group_id)
        .map_err(internal)?;
    Ok(Json(json!({ "ok": true })))
}

// ── Resources & authorizations ─────────────────────────────────────────

#[derive(Deserialize)]
struct ResourceBody {
    id: String,
    #[serde(rename = "type", default)]
    resource_type: String,
    #[serde(default)]
    address: String,
    protocol: Option<String>,
    port_from: Option<u16>,
    port_to: Option<u16>,
    remote_network_id: Option<String>,
}

async fn upsert_resource(
    State(cp): State<Arc<ControlPlane>>,
    Json(body): Json<ResourceBody>,
) -> ApiResult {
    let resource = AclResource {
        id: body.id.clone(),
        resource_type: normalize_resource_type(&body.resource_type, &body.address).to_string(),
        address: body.address.clone(),
        remote_network_id: body.remote_network_id.clone(),
    };
    cp.acls.upsert_resource(resource.clone()).map_err(bad_request)?;
    cp.db
        .save_resource(&ResourceRow {
            id: body.id,
            resource_type: resource.resource_type.clone(),
            address: body.address,
            protocol: body.protocol,
            port_from: body.port_from,
            port_to: body.port_to,
            remote_network_id: body.remote_network_id,
        })
        .map_err(internal)?;
    info!(resource_id = %resource.id, "resource upserted");
    cp.notify_resource_upsert(resource);
    Ok(Json(json!({ "ok": true })))
}

async fn remove_resource(
    State(cp): State<Arc<ControlPlane>>,
    Path(resource_id): Path<String>,
) -> ApiResult {
    cp.acls.delete_resource(&resource_id);
    cp.db.delete_resource(&resource_id).map_err(internal)?;
    info!(%resource_id, "resource removed");
    cp.notify_resource_removed(&resource_id);
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
struct AuthorizationBody {
    resource_id: String,
    principal_spiffe: String,
    #[serde(default)]
    filters: Vec<AclFilter>,
}

async fn assign_authorization(
    State(cp): State<Arc<ControlPlane>>,
    Json(body): Json<AuthorizationBody>,
) -> ApiResult {
    let auth = cp
        .acls
        .assign(&body.resource_id, &body.principal_spiffe, body.filters)
        .map_err(bad_request)?;
    cp.db.save_authorization(&auth).map_err(internal)?;
    info!(resource_id = %auth.resource_id, principal = %auth.principal_spiffe, "authorization assigned");
    cp.notify_authorization_upsert(auth);
    Ok(Json(json!({ "ok": true })))
}

async fn remove_authorization(
    State(cp): State<Arc<ControlPlane>>,
    Path((resource_id, principal)): Path<(String, String)>,
) -> ApiResult {
    cp.acls.remove_assignment(&resource_id, &principal);
    cp.db
        .delete_authorization(&resource_id, &principal)
        .map_err(internal)?;
    cp.notify_authorization_removed(&resource_id, &principal);
    Ok(Json(json!({ "ok": true })))
}

// ── Tunnelers & inspection ─────────────────────────────────────────────

#[derive(Deserialize)]
struct TunnelerBody {
    tunneler_id: String,
    spiffe_id: String,
}

async fn admit_tunneler(
    State(cp): State<Arc<ControlPlane>>,
    Json(body): Json<TunnelerBody>,
) -> ApiResult {
    if body.tunneler_id.is_empty() || body.spiffe_id.is_empty() {
        return Err(bad_request("tunneler_id and spiffe_id required"));
    }
    info!(tunneler_id = %body.tunneler_id, "tunneler admitted");
    cp.notify_tunneler_allowed(&body.tunneler_id, &body.spiffe_id);
    Ok(Json(json!({ "ok": true })))
}

async fn list_tunnelers(State(cp): State<Arc<ControlPlane>>) -> Json<Value> {
    Json(json!({
        "admitted": cp.admitted.list(),
        "status": cp.tunneler_status.list(),
    }))
}

/// Push a freshly compiled snapshot to every connected connector.
async fn resync(State(cp): State<Arc<ControlPlane>>) -> Json<Value> {
    cp.resync_all();
    Json(json!({ "ok": true }))
}

async fn acl_state(State(cp): State<Arc<ControlPlane>>) -> Json<Value> {
    Json(json!(cp.acls.snapshot()))
}

#[derive(Deserialize)]
struct AuditQuery {
    #[serde(default = "default_audit_limit")]
    limit: usize,
}

fn default_audit_limit() -> usize {
    100
}

async fn list_audit(
    State(cp): State<Arc<ControlPlane>>,
    Query(query): Query<AuditQuery>,
) -> ApiResult {
    let rows = cp.db.list_audit(query.limit).map_err(internal)?;
    Ok(Json(json!({ "audit": rows })))
}
