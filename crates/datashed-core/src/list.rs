//! Dataset enumeration.
//!
//! Datasets are laid out as `<prefix>/<collection>/<dataset>/…`, so listing
//! is two levels of child-prefix queries against the adapter. A
//! registry-wide listing unions results across stores in rank order.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{Result, TransportSnafu};
use crate::metadata::join_key;
use crate::object_store::ObjectStore;
use crate::registry::{self, Store};

/// List collections and their datasets.
///
/// With `collection`, only that collection's datasets are returned. With
/// `store_id`, only the named store is consulted; otherwise every registered
/// store contributes, in rank order.
pub async fn list_datasets(
    adapter: &Arc<dyn ObjectStore>,
    collection: Option<&str>,
    store_id: Option<&str>,
) -> Result<BTreeMap<String, Vec<String>>> {
    let stores: Vec<Store> = match store_id {
        Some(id) => vec![registry::lookup(id)?],
        None => registry::registry()?
            .iter()
            .map(|(_, store)| store.clone())
            .collect(),
    };

    let mut found: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for store in &stores {
        let collections = match collection {
            Some(coll) => vec![coll.to_string()],
            None => child_names(adapter, store, store.prefix()).await?,
        };
        for coll in collections {
            let parent = join_key([store.prefix(), &coll]);
            for dataset in child_names(adapter, store, &parent).await? {
                found.entry(coll.clone()).or_default().insert(dataset);
            }
        }
    }

    Ok(found
        .into_iter()
        .filter(|(_, datasets)| !datasets.is_empty())
        .map(|(coll, datasets)| (coll, datasets.into_iter().collect()))
        .collect())
}

/// Immediate child prefix names under `parent` in `store`.
async fn child_names(
    adapter: &Arc<dyn ObjectStore>,
    store: &Store,
    parent: &str,
) -> Result<Vec<String>> {
    let parent = if parent.is_empty() {
        String::new()
    } else {
        format!("{parent}/")
    };
    let prefixes = adapter
        .list_prefixes(store.bucket(), &parent)
        .await
        .map_err(|e| {
            TransportSnafu {
                message: format!("listing {}/{parent}: {e}", store.bucket()),
            }
            .build()
        })?;

    Ok(prefixes
        .into_iter()
        .filter_map(|p| {
            p.trim_end_matches('/')
                .rsplit('/')
                .next()
                .map(str::to_string)
        })
        .collect())
}
