/// Derive a stable-ish node identifier.
///
/// Prefers the `SOLO_NODE_ID` environment variable.  Falls back to
/// `<hostname>-<random-8-chars>` so that every process gets a unique id even
/// on the same host.
pub fn node_id() -> String {
    std::env::var("SOLO_NODE_ID").unwrap_or_else(|_| {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        let suffix = &uuid::Uuid::new_v4().to_string()[..8];
        format!("{hostname}-{suffix}")
    })
}

/// Holder token for one lease instance: `<node_id>:<uuid>`.
///
/// Two controllers in the same process never share a token, so one of them
/// can never extend or release a key the other holds.
pub fn holder_token(node_id: &str) -> String {
    format!("{node_id}:{}", uuid::Uuid::new_v4())
}
