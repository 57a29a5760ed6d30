//! In-memory provider.
//!
//! Keeps objects in a map, assigns ids derived from a hash of the logical
//! key and a call counter, and fabricates the outputs each kind declares
//! (for instance a provider-assigned IPv6 /56 for a VPC). Faults can be
//! injected per resource to exercise retries and partial failure.

use async_trait::async_trait;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::ImageRecord;
use crate::error::ProviderError;
use crate::resource::{Attributes, ResourceKey, ResourceKind};
use crate::state::StateSnapshot;

use super::{ApplyRequest, LookupQuery, Provider, Step};

/// Default availability zone for subnets without one.
const DEFAULT_AZ: &str = "us-east-1a";

/// An injected failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Every call for the resource fails.
    Always(ProviderError),
    /// The next `remaining` calls fail, later calls succeed.
    Times {
        /// Error returned.
        error: ProviderError,
        /// Failures left.
        remaining: u32,
    },
    /// Calls succeed but the named output attribute is missing.
    OmitOutput(String),
    /// Delete steps fail, creates and updates succeed.
    OnDelete(ProviderError),
}

#[derive(Debug, Clone)]
struct SimObject {
    key: ResourceKey,
    attributes: Attributes,
}

/// Deterministic in-memory [`Provider`].
#[derive(Debug, Default)]
pub struct SimulatedProvider {
    images: Vec<ImageRecord>,
    latency: Duration,
    objects: Mutex<BTreeMap<String, SimObject>>,
    faults: Mutex<HashMap<ResourceKey, Fault>>,
    log: Mutex<Vec<(ResourceKey, Step)>>,
    counter: AtomicU64,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SimulatedProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the image catalog used by lookups.
    #[must_use]
    pub fn with_images(mut self, images: Vec<ImageRecord>) -> Self {
        self.images = images;
        self
    }

    /// Makes every apply call take `latency`.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Injects a fault for a resource.
    pub fn inject(&self, key: ResourceKey, fault: Fault) {
        lock(&self.faults).insert(key, fault);
    }

    /// Makes every call for `key` fail with `error`.
    pub fn fail_on(&self, key: ResourceKey, error: ProviderError) {
        self.inject(key, Fault::Always(error));
    }

    /// Makes the next `times` calls for `key` fail with `error`.
    pub fn fail_times(&self, key: ResourceKey, times: u32, error: ProviderError) {
        self.inject(
            key,
            Fault::Times {
                error,
                remaining: times,
            },
        );
    }

    /// Registers the objects recorded in a snapshot as existing, so a fresh
    /// process can update and delete what an earlier run created.
    pub fn adopt(&self, snapshot: &StateSnapshot) {
        let mut objects = lock(&self.objects);
        let recorded = snapshot
            .resources
            .iter()
            .map(|(key, entry)| (key, &entry.id, &entry.outputs))
            .chain(snapshot.deposed.iter().map(|d| (&d.key, &d.id, &d.outputs)));
        for (key, id, outputs) in recorded {
            objects.insert(
                id.clone(),
                SimObject {
                    key: key.clone(),
                    attributes: outputs.clone(),
                },
            );
        }
        debug!(
            "Adopted {} recorded and {} deposed objects",
            snapshot.len(),
            snapshot.deposed.len()
        );
    }

    /// Removes any fault for a resource.
    pub fn clear_fault(&self, key: &ResourceKey) {
        lock(&self.faults).remove(key);
    }

    /// Total apply calls received.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent apply calls observed.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Every apply call in arrival order.
    #[must_use]
    pub fn call_log(&self) -> Vec<(ResourceKey, Step)> {
        lock(&self.log).clone()
    }

    /// Number of objects that currently exist.
    #[must_use]
    pub fn object_count(&self) -> usize {
        lock(&self.objects).len()
    }

    /// Returns true if an object with `id` exists.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        lock(&self.objects).contains_key(id)
    }

    /// Ids of the existing objects created for `key`.
    #[must_use]
    pub fn ids_for(&self, key: &ResourceKey) -> Vec<String> {
        lock(&self.objects)
            .iter()
            .filter(|(_, o)| &o.key == key)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn take_fault(&self, key: &ResourceKey) -> Option<Fault> {
        let mut faults = lock(&self.faults);
        match faults.get(key).cloned()? {
            Fault::Times { remaining: 0, .. } => {
                faults.remove(key);
                None
            }
            Fault::Times { error, remaining } => {
                faults.insert(
                    key.clone(),
                    Fault::Times {
                        error: error.clone(),
                        remaining: remaining - 1,
                    },
                );
                Some(Fault::Always(error))
            }
            fault => Some(fault),
        }
    }

    fn next_hash(&self, key: &ResourceKey) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let mut hasher = Sha256::new();
        hasher.update(key.to_string().as_bytes());
        hasher.update(n.to_le_bytes());
        hex::encode(hasher.finalize())
    }

    fn create(&self, request: &ApplyRequest) -> Result<Attributes, ProviderError> {
        check_properties(request)?;

        let hash = self.next_hash(&request.key);
        let kind = request.key.kind;
        let id = format!("{}-{}", kind.id_prefix(), &hash[..17]);

        let mut attributes: Attributes = request.properties.clone();
        attributes.insert(String::from("id"), serde_json::json!(id));
        computed_outputs(kind, &id, &hash, &request.properties, &mut attributes);

        lock(&self.objects).insert(
            id.clone(),
            SimObject {
                key: request.key.clone(),
                attributes: attributes.clone(),
            },
        );
        debug!("Simulated create of {} as {id}", request.key);
        Ok(attributes)
    }

    fn update(&self, request: &ApplyRequest) -> Result<Attributes, ProviderError> {
        check_properties(request)?;
        let id = request
            .prior_id()
            .ok_or_else(|| ProviderError::rejected(format!("{}: update without an id", request.key)))?
            .to_string();

        let mut objects = lock(&self.objects);
        let object = objects
            .get_mut(&id)
            .ok_or_else(|| ProviderError::NotFound { id: id.clone() })?;
        for (name, value) in &request.properties {
            object.attributes.insert(name.clone(), value.clone());
        }
        debug!("Simulated update of {} ({id})", request.key);
        Ok(object.attributes.clone())
    }

    fn delete(&self, request: &ApplyRequest) -> Result<Attributes, ProviderError> {
        let id = request
            .prior_id()
            .ok_or_else(|| ProviderError::rejected(format!("{}: delete without an id", request.key)))?;

        lock(&self.objects)
            .remove(id)
            .map(|o| o.attributes)
            .ok_or_else(|| ProviderError::NotFound { id: id.to_string() })
            .inspect(|_| debug!("Simulated delete of {} ({id})", request.key))
    }
}

#[async_trait]
impl Provider for SimulatedProvider {
    async fn apply(&self, request: ApplyRequest) -> Result<Attributes, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.log).push((request.key.clone(), request.step));

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        trace!("Simulated {} of {}", request.step, request.key);

        let mut omit = None;
        match self.take_fault(&request.key) {
            Some(Fault::Always(error) | Fault::Times { error, .. }) => return Err(error),
            Some(Fault::OnDelete(error)) if request.step == Step::Delete => return Err(error),
            Some(Fault::OmitOutput(attribute)) => omit = Some(attribute),
            Some(Fault::OnDelete(_)) | None => {}
        }

        let mut attributes = match request.step {
            Step::Create => self.create(&request)?,
            Step::Update => self.update(&request)?,
            Step::Delete => self.delete(&request)?,
        };
        if let Some(attribute) = omit {
            attributes.remove(&attribute);
        }
        Ok(attributes)
    }

    async fn lookup(&self, query: LookupQuery) -> Result<String, ProviderError> {
        let filters = query
            .filters
            .iter()
            .map(|(attribute, patterns)| -> Result<(&str, Vec<Regex>), ProviderError> {
                let compiled = patterns
                    .iter()
                    .map(|p| glob_regex(p))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| {
                        ProviderError::rejected(format!("lookup '{}': bad filter pattern: {e}", query.name))
                    })?;
                Ok((attribute.as_str(), compiled))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut candidates: Vec<&ImageRecord> = self
            .images
            .iter()
            .filter(|image| query.owners.is_empty() || query.owners.contains(&image.owner))
            .filter(|image| {
                filters.iter().all(|(attribute, patterns)| {
                    image_attribute(image, attribute)
                        .is_some_and(|value| patterns.iter().any(|re| re.is_match(value)))
                })
            })
            .collect();

        if candidates.is_empty() {
            return Err(ProviderError::LookupNoMatch { lookup: query.name });
        }

        if query.most_recent {
            candidates.sort_by(|a, b| a.creation_date.cmp(&b.creation_date));
            if let Some(newest) = candidates.last() {
                return Ok(newest.id.clone());
            }
        }

        if candidates.len() > 1 {
            return Err(ProviderError::rejected(format!(
                "lookup '{}' matched {} images; set most_recent",
                query.name,
                candidates.len()
            )));
        }
        Ok(candidates[0].id.clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Rejects requests a real provider would refuse.
fn check_properties(request: &ApplyRequest) -> Result<(), ProviderError> {
    let props = &request.properties;
    match request.key.kind {
        ResourceKind::Route => {
            let v4 = props.contains_key("destination_cidr_block");
            let v6 = props.contains_key("destination_ipv6_cidr_block");
            if v4 == v6 {
                return Err(ProviderError::rejected(format!(
                    "{}: exactly one of destination_cidr_block or destination_ipv6_cidr_block is required",
                    request.key
                )));
            }
        }
        ResourceKind::Subnet => {
            let native = props
                .get("ipv6_native")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            if native && !props.contains_key("ipv6_cidr_block") {
                return Err(ProviderError::rejected(format!(
                    "{}: an IPv6-native subnet needs ipv6_cidr_block",
                    request.key
                )));
            }
            if !native && !props.contains_key("cidr_block") {
                return Err(ProviderError::rejected(format!(
                    "{}: cidr_block is required unless ipv6_native is set",
                    request.key
                )));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Fills in the outputs a real provider would assign.
fn computed_outputs(
    kind: ResourceKind,
    id: &str,
    hash: &str,
    props: &BTreeMap<String, serde_json::Value>,
    attributes: &mut Attributes,
) {
    let byte = |i: usize| u8::from_str_radix(&hash[i * 2..i * 2 + 2], 16).unwrap_or(0);

    match kind {
        ResourceKind::Vpc => {
            let generated = props
                .get("assign_generated_ipv6_cidr_block")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            let ipv6 = if generated {
                serde_json::json!(format!("2600:1f18:{}:{:02x}00::/56", &hash[..4], byte(2)))
            } else {
                serde_json::Value::Null
            };
            attributes.insert(String::from("ipv6_cidr_block"), ipv6);
            attributes.insert(
                String::from("default_security_group_id"),
                serde_json::json!(format!("sg-{}", &hash[17..34])),
            );
        }
        ResourceKind::RouteTable => {
            attributes.insert(String::from("route_table_id"), serde_json::json!(id));
        }
        ResourceKind::Subnet => {
            attributes.insert(String::from("subnet_id"), serde_json::json!(id));
            attributes
                .entry(String::from("availability_zone"))
                .or_insert_with(|| serde_json::json!(DEFAULT_AZ));
        }
        ResourceKind::Instance => {
            attributes.insert(
                String::from("private_ip"),
                serde_json::json!(format!("10.0.{}.{}", byte(0), byte(1).max(4))),
            );
            attributes.insert(
                String::from("ipv6_addresses"),
                serde_json::json!([format!("2600:1f18::{}:{}", &hash[..4], &hash[4..8])]),
            );
        }
        ResourceKind::InternetGateway
        | ResourceKind::VpcGatewayAttachment
        | ResourceKind::Route
        | ResourceKind::SubnetRouteTableAssociation
        | ResourceKind::SecurityGroupIngress => {}
    }
}

fn image_attribute<'a>(image: &'a ImageRecord, attribute: &str) -> Option<&'a str> {
    match attribute {
        "name" => Some(&image.name),
        "architecture" => Some(&image.architecture),
        "owner-id" | "owner" => Some(&image.owner),
        "image-id" | "id" => Some(&image.id),
        _ => None,
    }
}

/// Compiles a filter pattern where `*` matches any run of characters into
/// an anchored regex.
fn glob_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let body = pattern.split('*').map(regex::escape).collect::<Vec<_>>().join(".*");
    Regex::new(&format!("^(?s){body}$"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LookupKind;

    fn image(id: &str, name: &str, arch: &str, owner: &str, date: &str) -> ImageRecord {
        ImageRecord {
            id: id.to_string(),
            name: name.to_string(),
            architecture: arch.to_string(),
            owner: owner.to_string(),
            creation_date: date.to_string(),
        }
    }

    fn catalog() -> Vec<ImageRecord> {
        vec![
            image("ami-alma-old", "AlmaLinux OS 9.3.20231113 x86_64", "x86_64", "764336703387", "2023-11-13T00:00:00Z"),
            image("ami-alma-new", "AlmaLinux OS 9.4.20240507 x86_64", "x86_64", "764336703387", "2024-05-07T00:00:00Z"),
            image("ami-alma-arm", "AlmaLinux OS 9.4.20240507 aarch64", "arm64", "764336703387", "2024-05-07T00:00:00Z"),
            image("ami-fake", "AlmaLinux OS 9.9 x86_64", "x86_64", "111111111111", "2025-01-01T00:00:00Z"),
        ]
    }

    fn query(owners: &[&str], arch: &str, name: &str) -> LookupQuery {
        LookupQuery {
            name: String::from("alma"),
            kind: LookupKind::Image,
            owners: owners.iter().map(ToString::to_string).collect(),
            filters: BTreeMap::from([
                (String::from("architecture"), vec![arch.to_string()]),
                (String::from("name"), vec![name.to_string()]),
            ]),
            most_recent: true,
        }
    }

    fn create(key: ResourceKey, props: &[(&str, serde_json::Value)]) -> ApplyRequest {
        ApplyRequest {
            key,
            step: Step::Create,
            properties: props
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
            prior: None,
        }
    }

    fn glob_match(pattern: &str, text: &str) -> bool {
        glob_regex(pattern).expect("pattern").is_match(text)
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("AlmaLinux OS 9.*", "AlmaLinux OS 9.4.20240507 x86_64"));
        assert!(glob_match("RHEL-9.4*", "RHEL-9.4.0_HVM"));
        assert!(glob_match("*", ""));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
        assert!(!glob_match("AlmaLinux OS 9.*", "AlmaLinux OS 8.9"));
        assert!(glob_match("a*ba", "aba"));
        assert!(!glob_match("ab*ba", "aba"));
        // Regex metacharacters in names are literal.
        assert!(glob_match("RHEL-9.4*", "RHEL-9.4.1"));
        assert!(!glob_match("RHEL-9.4*", "RHEL-904"));
        assert!(glob_match("a+b (c)*", "a+b (c) d"));
    }

    #[tokio::test]
    async fn test_lookup_picks_most_recent_from_owner() {
        let provider = SimulatedProvider::new().with_images(catalog());
        let id = provider
            .lookup(query(&["764336703387"], "x86_64", "AlmaLinux OS 9.*"))
            .await
            .expect("lookup");
        assert_eq!(id, "ami-alma-new");

        let arm = provider
            .lookup(query(&["764336703387"], "arm64", "AlmaLinux OS 9.*"))
            .await
            .expect("lookup");
        assert_eq!(arm, "ami-alma-arm");
    }

    #[tokio::test]
    async fn test_lookup_without_match() {
        let provider = SimulatedProvider::new().with_images(catalog());
        let err = provider
            .lookup(query(&["309956199498"], "x86_64", "RHEL-9.4*"))
            .await
            .expect_err("no match");
        assert_eq!(
            err,
            ProviderError::LookupNoMatch {
                lookup: String::from("alma")
            }
        );
    }

    #[tokio::test]
    async fn test_vpc_gets_generated_ipv6_block() {
        let provider = SimulatedProvider::new();
        let outputs = provider
            .apply(create(
                ResourceKey::new(ResourceKind::Vpc, "lab"),
                &[
                    ("cidr_block", serde_json::json!("10.0.0.0/16")),
                    ("assign_generated_ipv6_cidr_block", serde_json::json!(true)),
                ],
            ))
            .await
            .expect("create");

        let id = outputs["id"].as_str().expect("id");
        assert!(id.starts_with("vpc-"));
        assert!(outputs["ipv6_cidr_block"]
            .as_str()
            .is_some_and(|c| c.starts_with("2600:1f18:") && c.ends_with("00::/56")));
        assert!(provider.contains(id));
    }

    #[tokio::test]
    async fn test_update_and_delete_need_existing_object() {
        let provider = SimulatedProvider::new();
        let key = ResourceKey::new(ResourceKind::InternetGateway, "gw");
        let outputs = provider.apply(create(key.clone(), &[])).await.expect("create");

        let delete = ApplyRequest {
            key: key.clone(),
            step: Step::Delete,
            properties: BTreeMap::new(),
            prior: Some(outputs),
        };
        provider.apply(delete.clone()).await.expect("delete");
        assert_eq!(provider.object_count(), 0);

        let err = provider.apply(delete).await.expect_err("gone");
        assert!(matches!(err, ProviderError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let provider = SimulatedProvider::new();
        let key = ResourceKey::new(ResourceKind::InternetGateway, "gw");
        provider.fail_times(
            key.clone(),
            2,
            ProviderError::RateLimited { retry_after: None },
        );

        assert!(provider.apply(create(key.clone(), &[])).await.is_err());
        assert!(provider.apply(create(key.clone(), &[])).await.is_err());
        assert!(provider.apply(create(key.clone(), &[])).await.is_ok());
        assert_eq!(provider.calls(), 3);
        assert_eq!(provider.ids_for(&key).len(), 1);
    }

    #[tokio::test]
    async fn test_route_needs_one_destination() {
        let provider = SimulatedProvider::new();
        let err = provider
            .apply(create(
                ResourceKey::new(ResourceKind::Route, "default"),
                &[
                    ("route_table_id", serde_json::json!("rtb-1")),
                    ("gateway_id", serde_json::json!("igw-1")),
                ],
            ))
            .await
            .expect_err("no destination");
        assert!(matches!(err, ProviderError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_adopted_objects_can_be_deleted() {
        let key = ResourceKey::new(ResourceKind::InternetGateway, "gw");
        let mut snapshot = StateSnapshot::new("lab", "dev");
        let now = chrono::Utc::now();
        snapshot.upsert(
            key.clone(),
            crate::state::SnapshotEntry {
                kind: key.kind,
                name: key.name.clone(),
                id: String::from("igw-0123456789abcdef0"),
                order: 0,
                properties: BTreeMap::new(),
                outputs: BTreeMap::from([(String::from("id"), serde_json::json!("igw-0123456789abcdef0"))]),
                dependencies: Vec::new(),
                created_at: now,
                updated_at: now,
            },
        );

        snapshot.deposed.push(crate::state::DeposedObject {
            key: key.clone(),
            id: String::from("igw-0fedcba987654321"),
            outputs: BTreeMap::from([(String::from("id"), serde_json::json!("igw-0fedcba987654321"))]),
            deposed_at: now,
        });

        let provider = SimulatedProvider::new();
        provider.adopt(&snapshot);
        assert!(provider.contains("igw-0123456789abcdef0"));
        assert!(provider.contains("igw-0fedcba987654321"));

        let prior = snapshot.get(&key).map(|e| e.outputs.clone());
        provider
            .apply(ApplyRequest {
                key: key.clone(),
                step: Step::Delete,
                properties: BTreeMap::new(),
                prior,
            })
            .await
            .expect("delete");
        assert_eq!(provider.ids_for(&key), vec![String::from("igw-0fedcba987654321")]);
    }

    #[tokio::test]
    async fn test_delete_fault_spares_creates() {
        let key = ResourceKey::new(ResourceKind::InternetGateway, "gw");
        let provider = SimulatedProvider::new();
        provider.inject(key.clone(), Fault::OnDelete(ProviderError::rejected("dependency violation")));

        let outputs = provider
            .apply(ApplyRequest {
                key: key.clone(),
                step: Step::Create,
                properties: BTreeMap::new(),
                prior: None,
            })
            .await
            .expect("create");

        let err = provider
            .apply(ApplyRequest {
                key,
                step: Step::Delete,
                properties: BTreeMap::new(),
                prior: Some(outputs),
            })
            .await
            .expect_err("delete");
        assert!(matches!(err, ProviderError::Rejected { .. }));
        assert_eq!(provider.object_count(), 1);
    }
}
