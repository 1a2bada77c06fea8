use tessera_core::tuple::{SnapshotToken, TenantId};

pub fn audit_schema_write(
    tenant_id: &TenantId,
    version: u64,
    force: bool,
    breaking_changes_overridden: bool,
) {
    tracing::info!(
        target: "audit",
        event = "schema_write",
        tenant_id = %tenant_id,
        schema_version = version,
        force = force,
        breaking_changes_overridden = breaking_changes_overridden,
        "schema written"
    );
}

pub fn audit_relationship_write(
    tenant_id: &TenantId,
    write_count: usize,
    delete_count: usize,
    token: &SnapshotToken,
) {
    tracing::info!(
        target: "audit",
        event = "relationship_write",
        tenant_id = %tenant_id,
        write_count = write_count,
        delete_count = delete_count,
        snapshot_token = token.value(),
        "relationships written"
    );
}

pub fn audit_attribute_write(
    tenant_id: &TenantId,
    write_count: usize,
    delete_count: usize,
    token: &SnapshotToken,
) {
    tracing::info!(
        target: "audit",
        event = "attribute_write",
        tenant_id = %tenant_id,
        write_count = write_count,
        delete_count = delete_count,
        snapshot_token = token.value(),
        "attributes written"
    );
}

/// `key_hint` is the last four characters of the key, never the key itself.
pub fn audit_auth_success(tenant_id: &TenantId, key_hint: &str) {
    tracing::info!(
        target: "audit",
        event = "auth_success",
        tenant_id = %tenant_id,
        key_hint = key_hint,
        "authentication succeeded"
    );
}

pub fn audit_auth_failure(reason: &str) {
    tracing::warn!(
        target: "audit",
        event = "auth_failure",
        reason = reason,
        "authentication failed"
    );
}
