use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use oproxy_storage::ConfigSnapshot;

/// The authenticated downstream principal attached to a request.
#[derive(Debug, Clone)]
pub struct ClientPrincipal {
    pub key_id: i64,
    pub label: Option<String>,
    pub rpm_limit: Option<i64>,
}

/// Bearer-token lookup against an in-memory snapshot of client keys.
/// Replaced wholesale by the same refresh task that feeds the model router.
#[derive(Debug, Default)]
pub struct ClientAuth {
    keys: ArcSwap<HashMap<String, ClientPrincipal>>,
}

impl ClientAuth {
    pub fn new(snapshot: &ConfigSnapshot) -> Self {
        let auth = Self {
            keys: ArcSwap::from_pointee(HashMap::new()),
        };
        auth.rebuild(snapshot);
        auth
    }

    pub fn rebuild(&self, snapshot: &ConfigSnapshot) {
        let mut keys = HashMap::new();
        for row in &snapshot.client_keys {
            if !row.enabled {
                continue;
            }
            keys.insert(
                row.key_value.clone(),
                ClientPrincipal {
                    key_id: row.id,
                    label: row.label.clone(),
                    rpm_limit: row.rpm_limit,
                },
            );
        }
        self.keys.store(Arc::new(keys));
    }

    pub fn authenticate(&self, token: &str) -> Option<ClientPrincipal> {
        self.keys.load().get(token.trim()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oproxy_storage::ClientKeyRow;

    fn snapshot() -> ConfigSnapshot {
        ConfigSnapshot {
            client_keys: vec![
                ClientKeyRow {
                    id: 1,
                    key_value: "ck-live".to_string(),
                    label: Some("ci".to_string()),
                    rpm_limit: Some(10),
                    enabled: true,
                },
                ClientKeyRow {
                    id: 2,
                    key_value: "ck-dead".to_string(),
                    label: None,
                    rpm_limit: None,
                    enabled: false,
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn disabled_keys_do_not_authenticate() {
        let auth = ClientAuth::new(&snapshot());
        assert!(auth.authenticate("ck-live").is_some());
        assert!(auth.authenticate("ck-dead").is_none());
        assert!(auth.authenticate("unknown").is_none());
    }

    #[test]
    fn rebuild_swaps_the_key_set() {
        let auth = ClientAuth::new(&snapshot());
        auth.rebuild(&ConfigSnapshot::default());
        assert!(auth.authenticate("ck-live").is_none());
    }
}
