//! Resolution of read-only lookups before the graph is built.

use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::LookupConfig;
use crate::error::Result;

use super::{LookupQuery, Provider, RetryPolicy};

/// Resolves every lookup through the provider, retrying transient errors.
///
/// Returns lookup name to object id.
///
/// # Errors
///
/// Returns the provider error of the first lookup that fails.
pub async fn resolve_lookups(
    provider: &dyn Provider,
    lookups: &[LookupConfig],
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<BTreeMap<String, String>> {
    let mut resolved = BTreeMap::new();

    for lookup in lookups {
        let query = LookupQuery::from(lookup);
        let label = format!("lookup {}", lookup.name);
        let outcome = retry
            .run(&label, cancel, || provider.lookup(query.clone()))
            .await;
        let id = outcome.result?;
        info!("Lookup {} resolved to {id}", lookup.name);
        resolved.insert(lookup.name.clone(), id);
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LookupKind;
    use crate::error::{ProviderError, V6labError};
    use crate::provider::MockProvider;

    fn lookup(name: &str) -> LookupConfig {
        LookupConfig {
            name: name.to_string(),
            kind: LookupKind::Image,
            owners: vec![String::from("764336703387")],
            filters: BTreeMap::new(),
            most_recent: true,
        }
    }

    #[tokio::test]
    async fn test_resolves_each_lookup() {
        let mut provider = MockProvider::new();
        provider
            .expect_lookup()
            .times(2)
            .returning(|q| Ok(format!("ami-{}", q.name)));

        let resolved = resolve_lookups(
            &provider,
            &[lookup("alma"), lookup("rhel")],
            &RetryPolicy::none(),
            &CancellationToken::new(),
        )
        .await
        .expect("resolve");

        assert_eq!(resolved["alma"], "ami-alma");
        assert_eq!(resolved["rhel"], "ami-rhel");
    }

    #[tokio::test]
    async fn test_no_match_is_an_error() {
        let mut provider = MockProvider::new();
        provider.expect_lookup().returning(|q| {
            Err(ProviderError::LookupNoMatch { lookup: q.name })
        });

        let err = resolve_lookups(
            &provider,
            &[lookup("alma")],
            &RetryPolicy::none(),
            &CancellationToken::new(),
        )
        .await
        .expect_err("no match");

        assert!(matches!(
            err,
            V6labError::Provider(ProviderError::LookupNoMatch { .. })
        ));
    }
}
