use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use pretty_assertions::assert_eq;

use super::backend::*;
use super::cache::{AttributeCache, InMemoryCache, attribute_hash};
use super::definitions::ResourceDefinitions;
use super::{DispatcherConfig, MetricsDispatcher};
use crate::credentials::{AuthError, CredentialBroker, CredentialSource, IdentityClient};
use crate::sample::{Sample, SampleKind};

const DEFS: &str = r#"
    [[resources]]
    resource_type = "instance"
    metrics = ["instance", "instance:*", "memory*", "disk*"]
    archive_policy = "low"

    [resources.attributes]
    host = "$.metadata.host"
    display_name = "$.metadata.display_name"

    [[resources]]
    resource_type = "instance_network_interface"
    metrics = ["network.*"]

    [[resources]]
    resource_type = "storage_account"
    metrics = ["storage.objects*"]

    [[resources]]
    resource_type = "ignored_type"
    metrics = ["noise.*"]
    ignore = true
"#;

/// One recorded backend call, in the exact order the dispatcher made it.
#[derive(Debug, Clone, PartialEq)]
enum Call {
    Post {
        resource_type: String,
        resource_id: String,
        meter: String,
        values: Vec<f64>,
    },
    CreateResource {
        resource_type: String,
        resource_id: String,
        metrics: Vec<String>,
    },
    CreateMetric {
        resource_type: String,
        resource_id: String,
        meter: String,
        policy: Option<String>,
    },
    Update {
        resource_type: String,
        resource_id: String,
        attributes: BTreeMap<String, String>,
    },
}

/// Scriptable backend that records its call sequence.
#[derive(Default)]
struct Script {
    /// `resource_id/meter` → how many posts still answer NoSuchMetric.
    no_such_metric: HashMap<String, u32>,
    /// Posts for these `resource_id/meter` keys fail with a generic error.
    post_broken: HashSet<String>,
    /// Resource ids that already exist on the backend.
    existing_resources: HashSet<String>,
    /// `resource_id/meter` keys whose metric already exists.
    existing_metrics: HashSet<String>,
    /// Resource ids whose update fails with a generic error.
    update_broken: HashSet<String>,
}

#[derive(Clone, Default)]
struct MockBackend {
    calls: Arc<Mutex<Vec<Call>>>,
    script: Arc<Mutex<Script>>,
}

impl MockBackend {
    fn recorded(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn posts(&self) -> usize {
        self.recorded().iter().filter(|c| matches!(c, Call::Post { .. })).count()
    }

    fn updates(&self) -> Vec<Call> {
        self.recorded()
            .into_iter()
            .filter(|c| matches!(c, Call::Update { .. }))
            .collect()
    }
}

impl MetricsBackend for MockBackend {
    fn post_measurements(
        &self,
        resource_type: &str,
        resource_id: &str,
        meter: &str,
        measurements: &[Measurement],
    ) -> Result<(), PostError> {
        self.calls.lock().unwrap().push(Call::Post {
            resource_type: resource_type.to_owned(),
            resource_id: resource_id.to_owned(),
            meter: meter.to_owned(),
            values: measurements.iter().map(|m| m.value).collect(),
        });
        let key = format!("{resource_id}/{meter}");
        let mut script = self.script.lock().unwrap();
        if script.post_broken.contains(&key) {
            return Err(PostError::Other(anyhow::anyhow!("backend exploded")));
        }
        if let Some(remaining) = script.no_such_metric.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(PostError::NoSuchMetric);
            }
        }
        Ok(())
    }

    fn create_resource(&self, resource_type: &str, resource: &BackendResource) -> Result<(), CreateResourceError> {
        self.calls.lock().unwrap().push(Call::CreateResource {
            resource_type: resource_type.to_owned(),
            resource_id: resource.id.clone(),
            metrics: resource.metrics.keys().cloned().collect(),
        });
        let mut script = self.script.lock().unwrap();
        if script.existing_resources.contains(&resource.id) {
            Err(CreateResourceError::AlreadyExists)
        } else {
            script.existing_resources.insert(resource.id.clone());
            Ok(())
        }
    }

    fn create_metric(
        &self,
        resource_type: &str,
        resource_id: &str,
        meter: &str,
        policy: &MetricPolicy,
    ) -> Result<(), CreateMetricError> {
        self.calls.lock().unwrap().push(Call::CreateMetric {
            resource_type: resource_type.to_owned(),
            resource_id: resource_id.to_owned(),
            meter: meter.to_owned(),
            policy: policy.archive_policy_name.clone(),
        });
        let key = format!("{resource_id}/{meter}");
        if self.script.lock().unwrap().existing_metrics.contains(&key) {
            Err(CreateMetricError::AlreadyExists)
        } else {
            Ok(())
        }
    }

    fn update_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
        attributes: &BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(Call::Update {
            resource_type: resource_type.to_owned(),
            resource_id: resource_id.to_owned(),
            attributes: attributes.clone(),
        });
        if self.script.lock().unwrap().update_broken.contains(resource_id) {
            anyhow::bail!("update rejected");
        }
        Ok(())
    }
}

struct MockIdentity {
    lookups: AtomicU32,
}

impl IdentityClient for MockIdentity {
    fn find_project_id(&self, name: &str) -> anyhow::Result<String> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        assert_eq!(name, "metering");
        Ok("svc-proj".to_owned())
    }
}

struct MockCredentials {
    identity: Arc<MockIdentity>,
    fail: bool,
}

impl CredentialSource for MockCredentials {
    fn new_client(&self) -> Result<Arc<dyn IdentityClient>, AuthError> {
        if self.fail {
            Err(AuthError::new("identity service down"))
        } else {
            Ok(Arc::clone(&self.identity) as Arc<dyn IdentityClient>)
        }
    }
}

struct Fixture {
    backend: MockBackend,
    identity: Arc<MockIdentity>,
    dispatcher: MetricsDispatcher,
}

fn fixture(cache: Option<Arc<dyn AttributeCache>>) -> Fixture {
    fixture_with(cache, DispatcherConfig::default(), false)
}

fn fixture_with(cache: Option<Arc<dyn AttributeCache>>, config: DispatcherConfig, fail_auth: bool) -> Fixture {
    let backend = MockBackend::default();
    let identity = Arc::new(MockIdentity {
        lookups: AtomicU32::new(0),
    });
    let credentials = Arc::new(CredentialBroker::new(Box::new(MockCredentials {
        identity: Arc::clone(&identity),
        fail: fail_auth,
    })));
    let dispatcher = MetricsDispatcher::new(
        Box::new(backend.clone()),
        credentials,
        ResourceDefinitions::parse(DEFS).unwrap(),
        cache,
        config,
    );
    Fixture {
        backend,
        identity,
        dispatcher,
    }
}

fn sample(resource_id: &str, meter: &str, volume: f64, at_secs: u64) -> Sample {
    Sample {
        resource_id: resource_id.to_owned(),
        meter: meter.to_owned(),
        kind: SampleKind::Gauge,
        unit: "MB".to_owned(),
        volume,
        timestamp: SystemTime::UNIX_EPOCH + Duration::from_secs(at_secs),
        user_id: "u-1".to_owned(),
        project_id: "p-1".to_owned(),
        metadata: BTreeMap::from([
            ("host".to_owned(), "cn-7".to_owned()),
            ("display_name".to_owned(), "web-1".to_owned()),
        ]),
    }
}

fn expected_extras() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("host".to_owned(), "cn-7".to_owned()),
        ("display_name".to_owned(), "web-1".to_owned()),
    ])
}

#[test]
fn grouping_is_deterministic_regardless_of_input_order() {
    let batch = vec![
        sample("i-2", "memory.usage", 2.0, 10),
        sample("i-1", "memory.total", 512.0, 10),
        sample("i-1", "memory.usage", 1.0, 20),
        sample("i-1", "memory.usage", 1.5, 10),
    ];
    let mut reversed = batch.clone();
    reversed.reverse();

    let f1 = fixture(None);
    f1.dispatcher.dispatch(batch).unwrap();
    let f2 = fixture(None);
    f2.dispatcher.dispatch(reversed).unwrap();

    let calls = f1.backend.recorded();
    assert_eq!(calls, f2.backend.recorded());
    // resources in id order, meters in name order, measurements in time order
    assert_eq!(
        calls[0],
        Call::Post {
            resource_type: "instance".to_owned(),
            resource_id: "i-1".to_owned(),
            meter: "memory.total".to_owned(),
            values: vec![512.0],
        }
    );
    assert_eq!(
        calls[1],
        Call::Post {
            resource_type: "instance".to_owned(),
            resource_id: "i-1".to_owned(),
            meter: "memory.usage".to_owned(),
            values: vec![1.5, 1.0],
        }
    );
}

#[test]
fn two_meters_same_resource_post_twice_update_once() {
    let f = fixture(None);
    f.dispatcher
        .dispatch(vec![
            sample("i-1", "memory.usage", 1.0, 10),
            sample("i-1", "memory.total", 512.0, 10),
        ])
        .unwrap();

    assert_eq!(f.backend.posts(), 2);
    let updates = f.backend.updates();
    assert_eq!(
        updates,
        vec![Call::Update {
            resource_type: "instance".to_owned(),
            resource_id: "i-1".to_owned(),
            attributes: expected_extras(),
        }]
    );
}

#[test]
fn no_such_metric_triggers_one_repair_and_one_retry() {
    let f = fixture(None);
    f.backend
        .script
        .lock()
        .unwrap()
        .no_such_metric
        .insert("i-1/disk.read".to_owned(), 1);

    f.dispatcher.dispatch(vec![sample("i-1", "disk.read", 9.0, 10)]).unwrap();

    let calls = f.backend.recorded();
    assert!(matches!(&calls[0], Call::Post { meter, .. } if meter == "disk.read"));
    assert_eq!(
        calls[1],
        Call::CreateResource {
            resource_type: "instance".to_owned(),
            resource_id: "i-1".to_owned(),
            metrics: vec![
                "disk*".to_owned(),
                "instance".to_owned(),
                "instance:*".to_owned(),
                "memory*".to_owned(),
            ],
        }
    );
    assert!(matches!(&calls[2], Call::Post { meter, .. } if meter == "disk.read"));
    assert_eq!(f.backend.posts(), 2);
}

#[test]
fn retry_failing_again_gives_up_without_a_third_attempt() {
    let f = fixture(None);
    f.backend
        .script
        .lock()
        .unwrap()
        .no_such_metric
        .insert("i-1/disk.read".to_owned(), 2);

    f.dispatcher.dispatch(vec![sample("i-1", "disk.read", 9.0, 10)]).unwrap();

    // post, repair, retried post: exactly two posts, then give up
    assert_eq!(f.backend.posts(), 2);
    // the attribute reconciliation still runs for the group
    assert_eq!(f.backend.updates().len(), 1);
}

#[test]
fn repair_tolerates_losing_both_races() {
    let f = fixture(None);
    {
        let mut script = f.backend.script.lock().unwrap();
        script.no_such_metric.insert("i-1/memory.usage".to_owned(), 1);
        script.existing_resources.insert("i-1".to_owned());
        script.existing_metrics.insert("i-1/memory.usage".to_owned());
    }

    f.dispatcher
        .dispatch(vec![sample("i-1", "memory.usage", 1.0, 10)])
        .unwrap();

    let calls = f.backend.recorded();
    // create_resource lost the race, so the missing metric is created
    // instead; losing that race too is still success.
    assert!(matches!(&calls[1], Call::CreateResource { .. }));
    assert_eq!(
        calls[2],
        Call::CreateMetric {
            resource_type: "instance".to_owned(),
            resource_id: "i-1".to_owned(),
            meter: "memory.usage".to_owned(),
            policy: Some("low".to_owned()),
        }
    );
    assert!(matches!(&calls[3], Call::Post { .. }));
    assert_eq!(f.backend.posts(), 2);
}

#[test]
fn service_activity_is_filtered_out() {
    let f = fixture(None);
    let mut service_sample = sample("i-1", "memory.usage", 1.0, 10);
    service_sample.project_id = "svc-proj".to_owned();

    // the backend's own storage account, exposed as a monitorable resource
    let mut storage_sample = sample("svc-proj", "storage.objects.size", 4.0, 10);
    storage_sample.project_id = "p-2".to_owned();

    // same resource id but a meter that is not a storage-account meter
    let not_storage = sample("svc-proj", "memory.usage", 1.0, 10);

    f.dispatcher
        .dispatch(vec![service_sample, storage_sample, not_storage])
        .unwrap();

    let calls = f.backend.recorded();
    assert_eq!(f.backend.posts(), 1);
    assert!(matches!(
        &calls[0],
        Call::Post { resource_id, meter, .. } if resource_id == "svc-proj" && meter == "memory.usage"
    ));
}

#[test]
fn service_project_id_is_resolved_once() {
    let f = fixture(None);
    f.dispatcher.dispatch(vec![sample("i-1", "memory.usage", 1.0, 10)]).unwrap();
    f.dispatcher.dispatch(vec![sample("i-1", "memory.usage", 2.0, 20)]).unwrap();
    assert_eq!(f.identity.lookups.load(Ordering::SeqCst), 1);
}

#[test]
fn credential_failure_is_fatal_for_the_batch() {
    let f = fixture_with(None, DispatcherConfig::default(), true);
    let err = f
        .dispatcher
        .dispatch(vec![sample("i-1", "memory.usage", 1.0, 10)])
        .unwrap_err();
    assert!(err.to_string().contains("authentication failed"));
    assert!(f.backend.recorded().is_empty());
}

#[test]
fn filter_disabled_does_not_touch_the_identity_service() {
    let config = DispatcherConfig {
        filter_service_activity: false,
        ..DispatcherConfig::default()
    };
    let f = fixture_with(None, config, true);
    // auth would fail, but the filter is off so nobody asks
    f.dispatcher.dispatch(vec![sample("i-1", "memory.usage", 1.0, 10)]).unwrap();
    assert_eq!(f.backend.posts(), 1);
}

#[test]
fn unmapped_and_ignored_meters_are_dropped() {
    let f = fixture(None);
    f.dispatcher
        .dispatch(vec![
            sample("i-1", "exotic.meter", 1.0, 10),
            sample("i-1", "noise.level", 2.0, 10),
            sample("i-1", "memory.usage", 3.0, 10),
        ])
        .unwrap();
    assert_eq!(f.backend.posts(), 1);
}

#[test]
fn meter_group_failures_do_not_abort_the_batch() {
    let f = fixture(None);
    f.backend
        .script
        .lock()
        .unwrap()
        .post_broken
        .insert("i-1/memory.total".to_owned());

    f.dispatcher
        .dispatch(vec![
            sample("i-1", "memory.total", 512.0, 10),
            sample("i-1", "memory.usage", 1.0, 10),
            sample("i-2", "memory.usage", 2.0, 10),
        ])
        .unwrap();

    // the broken group is logged and skipped, everything else is posted
    assert_eq!(f.backend.posts(), 3);
    assert_eq!(f.backend.updates().len(), 2);
}

#[test]
fn resource_group_failures_do_not_abort_the_batch() {
    let f = fixture(None);
    f.backend.script.lock().unwrap().update_broken.insert("i-1".to_owned());

    f.dispatcher
        .dispatch(vec![
            sample("i-1", "memory.usage", 1.0, 10),
            sample("i-2", "memory.usage", 2.0, 10),
        ])
        .unwrap();

    // i-1's update fails after its post; i-2 is still fully processed
    assert_eq!(f.backend.posts(), 2);
    assert_eq!(f.backend.updates().len(), 2);
}

#[test]
fn without_cache_every_cycle_updates() {
    let f = fixture(None);
    f.dispatcher.dispatch(vec![sample("i-1", "memory.usage", 1.0, 10)]).unwrap();
    f.dispatcher.dispatch(vec![sample("i-1", "memory.usage", 2.0, 20)]).unwrap();
    assert_eq!(f.backend.updates().len(), 2);
}

#[test]
fn cache_suppresses_redundant_updates() {
    let cache: Arc<dyn AttributeCache> = Arc::new(InMemoryCache::new());
    let f = fixture(Some(cache));

    f.dispatcher.dispatch(vec![sample("i-1", "memory.usage", 1.0, 10)]).unwrap();
    f.dispatcher.dispatch(vec![sample("i-1", "memory.usage", 2.0, 20)]).unwrap();
    assert_eq!(f.backend.updates().len(), 1);

    // changed attributes: the hash differs, so the update goes through
    let mut changed = sample("i-1", "memory.usage", 3.0, 30);
    changed.metadata.insert("host".to_owned(), "cn-8".to_owned());
    f.dispatcher.dispatch(vec![changed]).unwrap();
    assert_eq!(f.backend.updates().len(), 2);
}

#[test]
fn shared_cache_suppresses_the_second_worker() {
    // two dispatcher instances (as in a fleet) sharing one cache: the first
    // update populates the cache, the second worker's check finds the hash
    // and skips the call
    let cache: Arc<dyn AttributeCache> = Arc::new(InMemoryCache::new());
    let f1 = fixture(Some(Arc::clone(&cache)));
    let f2 = fixture(Some(cache));

    f1.dispatcher.dispatch(vec![sample("i-1", "memory.usage", 1.0, 10)]).unwrap();
    f2.dispatcher.dispatch(vec![sample("i-1", "memory.usage", 1.0, 10)]).unwrap();

    assert_eq!(f1.backend.updates().len(), 1);
    assert!(f2.backend.updates().is_empty());
}

/// Misses on the first `get` and answers with a fixed value afterwards, as if
/// another process filled the entry in between. Records every `set`.
struct RacingCache {
    answer: String,
    gets: AtomicU32,
    sets: Mutex<Vec<(String, String)>>,
}

impl AttributeCache for RacingCache {
    fn get(&self, _key: &str) -> Option<String> {
        if self.gets.fetch_add(1, Ordering::SeqCst) == 0 {
            None
        } else {
            Some(self.answer.clone())
        }
    }

    fn set(&self, key: &str, value: &str, _ttl: Duration) {
        self.sets.lock().unwrap().push((key.to_owned(), value.to_owned()));
    }
}

#[test]
fn recheck_under_the_lock_skips_a_racing_update() {
    // another worker pushes the same attributes between the unlocked check
    // and the lock acquisition: the re-check sees the fresh hash and the
    // update (and the cache write) are skipped
    let cache = Arc::new(RacingCache {
        answer: attribute_hash(&expected_extras()),
        gets: AtomicU32::new(0),
        sets: Mutex::new(Vec::new()),
    });
    let f = fixture(Some(Arc::clone(&cache) as Arc<dyn AttributeCache>));

    f.dispatcher.dispatch(vec![sample("i-1", "memory.usage", 1.0, 10)]).unwrap();

    assert_eq!(f.backend.posts(), 1);
    assert_eq!(cache.gets.load(Ordering::SeqCst), 2);
    assert!(f.backend.updates().is_empty());
    assert!(cache.sets.lock().unwrap().is_empty());
}

#[test]
fn expired_cache_entry_causes_a_fresh_update() {
    let cache: Arc<dyn AttributeCache> = Arc::new(InMemoryCache::new());
    let config = DispatcherConfig {
        cache_ttl: Duration::ZERO,
        ..DispatcherConfig::default()
    };
    let f = fixture_with(Some(cache), config, false);

    f.dispatcher.dispatch(vec![sample("i-1", "memory.usage", 1.0, 10)]).unwrap();
    f.dispatcher.dispatch(vec![sample("i-1", "memory.usage", 2.0, 20)]).unwrap();
    // the entry expired immediately, so the hash check cannot suppress
    assert_eq!(f.backend.updates().len(), 2);
}

#[test]
fn no_update_when_no_attributes_accumulate() {
    let f = fixture(None);
    // network.* maps to a definition without attribute extractors
    f.dispatcher
        .dispatch(vec![sample("i-1", "network.incoming.bytes", 1.0, 10)])
        .unwrap();
    assert_eq!(f.backend.posts(), 1);
    assert!(f.backend.updates().is_empty());
}

#[test]
fn empty_batch_is_a_no_op() {
    let f = fixture_with(None, DispatcherConfig::default(), true);
    // no samples: not even the service project id is resolved
    f.dispatcher.dispatch(Vec::new()).unwrap();
    assert!(f.backend.recorded().is_empty());
}
