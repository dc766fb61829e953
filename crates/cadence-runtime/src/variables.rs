//! Scoped variable store.
//!
//! Three tiers: the chain's own bucket, ancestor chains through the
//! parent-chain walk, then the named global scope. Writes land in the chain
//! bucket when the scope names an existing chain, otherwise in the global
//! map. Fast chains keep their buckets in the fast-chain map instead of the
//! state store.

use serde_json::Value;

use crate::engine::EngineShared;

pub(crate) const GLOBAL_SCOPE: &str = "global";

pub(crate) async fn set_variable(
    shared: &EngineShared,
    name: &str,
    value: Value,
    scope: Option<&str>,
    is_fast: bool,
) {
    let scope_name = scope.unwrap_or(GLOBAL_SCOPE);

    if is_fast {
        let mut fast_chains = shared.lock_fast_chains();
        if let Some(info) = fast_chains.get_mut(scope_name) {
            info.variables.insert(name.to_string(), value);
            return;
        }
        drop(fast_chains);
    } else {
        match shared.store.chain(scope_name).await {
            Ok(Some(mut chain)) => {
                chain.variables_by_name.insert(name.to_string(), value);
                if let Err(err) = shared.store.put_chain(chain).await {
                    tracing::warn!(scope = %scope_name, error = %err, "chain variable write failed");
                }
                return;
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(scope = %scope_name, error = %err, "chain lookup failed during variable write");
            }
        }
    }

    let mut globals = shared.lock_globals();
    globals
        .entry(scope_name.to_string())
        .or_default()
        .insert(name.to_string(), value);
}

pub(crate) async fn get_variable(
    shared: &EngineShared,
    name: &str,
    scope: Option<&str>,
    is_fast: bool,
) -> Option<Value> {
    let scope_name = scope.unwrap_or(GLOBAL_SCOPE);
    let mut walked_chain = false;

    if is_fast {
        let fast_chains = shared.lock_fast_chains();
        let mut current = Some(scope_name.to_string());
        while let Some(chain_id) = current {
            let Some(info) = fast_chains.get(&chain_id) else {
                break;
            };
            walked_chain = true;
            if let Some(value) = info.variables.get(name) {
                return Some(value.clone());
            }
            current = info.parent_chain_id.clone();
        }
    } else {
        let mut current = Some(scope_name.to_string());
        while let Some(chain_id) = current {
            let chain = match shared.store.chain(&chain_id).await {
                Ok(Some(chain)) => chain,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(scope = %chain_id, error = %err, "chain lookup failed during variable read");
                    break;
                }
            };
            walked_chain = true;
            if let Some(value) = chain.variables_by_name.get(name) {
                return Some(value.clone());
            }
            current = chain.parent_chain_id;
        }
    }

    // A chain scope falls back to the default global bucket; a non-chain
    // scope IS the global bucket.
    let global_scope = if walked_chain { GLOBAL_SCOPE } else { scope_name };
    let globals = shared.lock_globals();
    globals.get(global_scope)?.get(name).cloned()
}
