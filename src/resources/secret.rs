//! Credential secrets, one per managed role.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::core::ObjectMeta;
use tracing::warn;

use crate::cluster::users::{PgUser, PgUserMap, RoleOrigin};
use crate::resources::common::ClusterInfo;

/// Render secrets for every role that carries a password. Human users
/// authenticate via PAM and have none, so no secret is rendered for them.
pub fn generate_user_secrets(info: &ClusterInfo<'_>, pg_users: &PgUserMap) -> Vec<Secret> {
    pg_users
        .values()
        .filter_map(|user| generate_single_user_secret(info, user))
        .collect()
}

/// Render the credentials secret of one role, or `None` when the role has
/// no password.
pub fn generate_single_user_secret(info: &ClusterInfo<'_>, user: &PgUser) -> Option<Secret> {
    if user.password.is_empty() {
        if user.origin != RoleOrigin::TeamsApi {
            warn!(
                role = %user.name,
                "could not generate secret for role: role has no password"
            );
        }
        return None;
    }

    Some(Secret {
        metadata: ObjectMeta {
            name: Some(info.credential_secret_name(&user.name)),
            namespace: Some(info.namespace()),
            labels: Some(info.labels_set()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([
            (
                "username".to_string(),
                ByteString(user.name.clone().into_bytes()),
            ),
            (
                "password".to_string(),
                ByteString(user.password.clone().into_bytes()),
            ),
        ])),
        ..Default::default()
    })
}
