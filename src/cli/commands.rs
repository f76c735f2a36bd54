//! CLI command implementations
//!
//! `simulate` wires a replica set of in-memory shards over channels, each
//! running its own `ShardService`, and drives one recovery scenario per
//! object kind:
//! - whole objects held only by the primary, pushed to every replica
//! - an object the primary is missing, pulled from a replica first
//! - a tombstone replicated to every shard
//!
//! The report is one JSON document on stdout. Every shard must end up
//! byte-identical for the command to succeed.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use crate::observability::{Logger, MetricsRegistry, MetricsSnapshot, Severity};
use crate::replication::{
    ChannelTransport, Completion, Epoch, MemoryObject, MemoryStore, MissingItem, ObjectKey,
    RecoveryBackend, RecoveryConfig, RecoveryOutcome, ShardHandle, ShardId, ShardService,
    StaticMembership, VersionStamp,
};

/// Run the CLI with parsed arguments
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    run_command(cli.command)
}

/// Execute a CLI command
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Simulate {
            config,
            replicas,
            objects,
            object_size,
            omap_keys,
            max_push_bytes,
            seed,
            verbose,
        } => {
            let mut recovery = match config {
                Some(path) => load_config(&path)?,
                None => RecoveryConfig::default(),
            };
            if let Some(bytes) = max_push_bytes {
                recovery.max_push_bytes = bytes;
            }
            recovery.log_rounds = verbose;
            recovery.validate()?;

            let plan = SimulationPlan {
                replicas,
                objects,
                object_size,
                omap_keys,
                seed: seed.unwrap_or_else(|| rand::thread_rng().next_u64()),
            };
            plan.validate()?;

            Logger::set_min_severity(if verbose {
                Severity::Trace
            } else {
                Severity::Warn
            });
            simulate(recovery, plan)
        }
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn load_config(path: &Path) -> CliResult<RecoveryConfig> {
    RecoveryConfig::load(path).map_err(CliError::from)
}

/// Validate a configuration file and print the effective settings.
fn check_config(path: &Path) -> CliResult<()> {
    let config = load_config(path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

// =============================================================================
// Simulation
// =============================================================================

/// Shape of the simulated replica set.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationPlan {
    pub replicas: u32,
    pub objects: u32,
    pub object_size: u64,
    pub omap_keys: u32,
    pub seed: u64,
}

impl SimulationPlan {
    fn validate(&self) -> CliResult<()> {
        if self.replicas < 2 {
            return Err(CliError::invalid_argument("--replicas must be at least 2"));
        }
        if self.object_size > usize::MAX as u64 {
            return Err(CliError::invalid_argument("--object-size too large"));
        }
        Ok(())
    }

    fn shards(&self) -> Vec<ShardId> {
        (0..self.replicas).map(ShardId::new).collect()
    }
}

/// Result of one scenario.
#[derive(Debug, Serialize)]
struct ObjectReport {
    object: String,
    scenario: &'static str,
    version: String,
    outcome: Option<RecoveryOutcome>,
    error: Option<String>,
    /// Content digest per shard; `None` where the object is absent
    digests: BTreeMap<String, Option<u32>>,
    consistent: bool,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    run_id: String,
    started_at: String,
    finished_at: String,
    plan: SimulationPlan,
    config: RecoveryConfig,
    consistent: bool,
    objects: Vec<ObjectReport>,
    metrics: BTreeMap<String, MetricsSnapshot>,
}

struct Shard {
    id: ShardId,
    store: Arc<MemoryStore>,
    metrics: Arc<MetricsRegistry>,
    handle: ShardHandle,
    task: JoinHandle<()>,
}

enum Scenario {
    Push,
    Pull,
    Delete,
}

impl Scenario {
    fn as_str(&self) -> &'static str {
        match self {
            Scenario::Push => "push",
            Scenario::Pull => "pull",
            Scenario::Delete => "delete",
        }
    }
}

struct Pending {
    object: ObjectKey,
    version: VersionStamp,
    scenario: Scenario,
    completion: CliResult<Completion>,
}

fn simulate(config: RecoveryConfig, plan: SimulationPlan) -> CliResult<()> {
    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::io_error(format!("failed to create runtime: {}", e)))?;

    let report = rt.block_on(run_simulation(config, plan))?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.consistent {
        Ok(())
    } else {
        Err(CliError::simulation_failed(
            "replicas diverged after recovery",
        ))
    }
}

async fn run_simulation(
    config: RecoveryConfig,
    plan: SimulationPlan,
) -> CliResult<SimulationReport> {
    let started_at = chrono::Utc::now().to_rfc3339();
    let epoch = Epoch::new(1);
    let shards = plan.shards();
    let primary = shards[0];
    let membership = StaticMembership::new(shards.clone(), epoch);
    let transport = ChannelTransport::new();
    let mut rng = StdRng::seed_from_u64(plan.seed);

    let mut cluster = Vec::with_capacity(shards.len());
    for id in &shards {
        let inbox = transport.register(*id);
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let backend = RecoveryBackend::new(
            config.clone(),
            store.clone(),
            Arc::new(membership.view(*id)),
            Arc::new(transport.clone()),
            metrics.clone(),
        )?;
        let (handle, task) = ShardService::spawn(backend, inbox);
        cluster.push(Shard {
            id: *id,
            store,
            metrics,
            handle,
            task,
        });
    }

    // Seed the replica set before any recovery starts.
    let mut scenarios = Vec::new();
    for i in 0..plan.objects {
        let object = ObjectKey::new(format!("obj.{}", i));
        let version = VersionStamp::new(epoch.value(), u64::from(i) + 1);
        cluster[0]
            .store
            .insert(object.clone(), generate_object(&mut rng, version, &plan));
        for shard in &shards[1..] {
            membership.add_missing(*shard, object.clone(), MissingItem::whole(version));
        }
        scenarios.push((object, version, Scenario::Push));
    }

    let pulled = ObjectKey::new("pulled");
    let pulled_version = VersionStamp::new(epoch.value(), u64::from(plan.objects) + 1);
    cluster[1]
        .store
        .insert(pulled.clone(), generate_object(&mut rng, pulled_version, &plan));
    membership.add_missing(primary, pulled.clone(), MissingItem::whole(pulled_version));
    membership.set_pull_source(pulled.clone(), cluster[1].id);
    for shard in &shards[2..] {
        membership.add_missing(*shard, pulled.clone(), MissingItem::whole(pulled_version));
    }
    scenarios.push((pulled, pulled_version, Scenario::Pull));

    let doomed = ObjectKey::new("doomed");
    let created = VersionStamp::new(epoch.value(), 1);
    let deleted = VersionStamp::new(epoch.value(), u64::from(plan.objects) + 2);
    let body = generate_object(&mut rng, created, &plan);
    for shard in &cluster {
        shard.store.insert(doomed.clone(), body.clone());
    }
    for shard in &shards[1..] {
        membership.add_missing(*shard, doomed.clone(), MissingItem::whole(deleted));
    }
    scenarios.push((doomed, deleted, Scenario::Delete));

    let handle = cluster[0].handle.clone();
    let mut pending = Vec::with_capacity(scenarios.len());
    for (object, version, scenario) in scenarios {
        let completion = match scenario {
            Scenario::Delete => handle.recover_delete(object.clone(), version).await,
            Scenario::Push | Scenario::Pull => {
                handle.recover_object(object.clone(), version).await
            }
        };
        pending.push(Pending {
            object,
            version,
            scenario,
            completion: completion.map_err(CliError::from),
        });
    }

    let mut objects = Vec::with_capacity(pending.len());
    for p in pending {
        let (outcome, error) = match p.completion {
            Ok(completion) => match completion.wait().await {
                Ok(outcome) => (Some(outcome), None),
                Err(e) => (None, Some(e.to_string())),
            },
            Err(e) => (None, Some(e.to_string())),
        };

        let digests: BTreeMap<String, Option<u32>> = cluster
            .iter()
            .map(|shard| (shard.id.to_string(), shard.store.get(&p.object).map(|o| digest(&o))))
            .collect();
        let consistent = error.is_none()
            && outcome == Some(RecoveryOutcome::Recovered)
            && match p.scenario {
                Scenario::Delete => digests.values().all(Option::is_none),
                Scenario::Push | Scenario::Pull => {
                    let first = digests.values().next().copied().flatten();
                    first.is_some()
                        && digests.values().all(|d| *d == first)
                        && cluster.iter().all(|shard| {
                            shard.store.get(&p.object).map(|o| o.version) == Some(p.version)
                        })
                }
            };

        objects.push(ObjectReport {
            object: p.object.to_string(),
            scenario: p.scenario.as_str(),
            version: p.version.to_string(),
            outcome,
            error,
            digests,
            consistent,
        });
    }

    let mut metrics = BTreeMap::new();
    for shard in cluster {
        shard.handle.shutdown()?;
        shard
            .task
            .await
            .map_err(|e| CliError::simulation_failed(format!("shard task failed: {}", e)))?;
        metrics.insert(shard.id.to_string(), shard.metrics.snapshot());
    }

    Ok(SimulationReport {
        run_id: Uuid::new_v4().to_string(),
        started_at,
        finished_at: chrono::Utc::now().to_rfc3339(),
        consistent: objects.iter().all(|o| o.consistent),
        plan,
        config,
        objects,
        metrics,
    })
}

/// Random object body with omap and attrs.
fn generate_object(rng: &mut StdRng, version: VersionStamp, plan: &SimulationPlan) -> MemoryObject {
    let mut data = vec![0u8; plan.object_size as usize];
    rng.fill_bytes(&mut data);

    let mut header = vec![0u8; 16];
    rng.fill_bytes(&mut header);

    let mut omap = BTreeMap::new();
    for k in 0..plan.omap_keys {
        let mut value = vec![0u8; 32];
        rng.fill_bytes(&mut value);
        omap.insert(format!("key.{:06}", k), value);
    }

    let mut attrs = BTreeMap::new();
    attrs.insert("_".to_string(), version.to_string().into_bytes());
    attrs.insert("snapset".to_string(), rng.next_u64().to_le_bytes().to_vec());

    let mut object = MemoryObject {
        version,
        omap_header: header,
        omap,
        attrs,
        ..MemoryObject::default()
    };
    object.allocated.insert(0, data.len() as u64);
    object.data = data;
    object
}

/// CRC32 over data, omap and attrs.
fn digest(object: &MemoryObject) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&object.data);
    hasher.update(&object.omap_header);
    for (key, value) in &object.omap {
        hasher.update(key.as_bytes());
        hasher.update(value);
    }
    for (key, value) in &object.attrs {
        hasher.update(key.as_bytes());
        hasher.update(value);
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(replicas: u32) -> SimulationPlan {
        SimulationPlan {
            replicas,
            objects: 2,
            object_size: 64 * 1024,
            omap_keys: 8,
            seed: 7,
        }
    }

    #[test]
    fn test_plan_requires_two_replicas() {
        assert!(plan(1).validate().is_err());
        assert!(plan(2).validate().is_ok());
    }

    #[test]
    fn test_digest_covers_omap() {
        let mut rng = StdRng::seed_from_u64(1);
        let object = generate_object(&mut rng, VersionStamp::new(1, 1), &plan(3));
        let mut changed = object.clone();
        changed.omap.insert("extra".to_string(), vec![1]);
        assert_ne!(digest(&object), digest(&changed));
        assert_eq!(digest(&object), digest(&object.clone()));
    }

    #[test]
    fn test_simulation_converges() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let report = rt
            .block_on(run_simulation(RecoveryConfig::with_max_push_bytes(16 * 1024), plan(3)))
            .unwrap();

        assert!(report.consistent, "{:?}", report.objects);
        assert_eq!(report.objects.len(), 4);
        assert!(report.metrics["shard.0"].push_rounds >= 4 * 2);
        assert_eq!(report.metrics["shard.0"].pulls_committed, 1);
    }
}
