//! Container labels that mark what this service owns.

use std::collections::HashMap;

/// Present on every container the service creates.
pub const MANAGED: &str = "cee.managed";
/// Present on long-lived pool members.
pub const POOL: &str = "cee.pool";
pub const POOL_IMAGE: &str = "cee.pool.image";
/// Process instance that created the pool member.
pub const POOL_OWNER: &str = "cee.pool.owner";
/// Present on one-off containers created when the pool is exhausted.
pub const EPHEMERAL: &str = "cee.ephemeral";

pub const TRUE: &str = "true";

pub fn pool_member(image: &str, owner: &str) -> HashMap<String, String> {
    HashMap::from([
        (MANAGED.to_string(), TRUE.to_string()),
        (POOL.to_string(), TRUE.to_string()),
        (POOL_IMAGE.to_string(), image.to_string()),
        (POOL_OWNER.to_string(), owner.to_string()),
    ])
}

pub fn ephemeral() -> HashMap<String, String> {
    HashMap::from([
        (MANAGED.to_string(), TRUE.to_string()),
        (EPHEMERAL.to_string(), TRUE.to_string()),
    ])
}
