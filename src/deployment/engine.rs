/// Submits a deployment to the provider runtime and settles every output
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::state::{DeploymentState, ResourceRecord};
use super::{Deployment, ResourceNode};
use crate::config::ProviderConfig;
use crate::error::{Error, ResolutionError, Result};
use crate::output::OutputState;
use crate::provider::{Operation, ProviderFault, ProviderRequest, ProviderResponse, ProviderRuntime};
use crate::resource::{PropertyMap, Registry, Urn};

/// Where a resource ended up after `up`
#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    Created,
    Updated,
    /// Inputs matched the recorded state; nothing was sent
    Unchanged,
    Deleted,
    Failed(Error),
    Cancelled,
}

impl Phase {
    pub fn is_success(&self) -> bool {
        !matches!(self, Phase::Failed(_) | Phase::Cancelled)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Created => write!(f, "created"),
            Phase::Updated => write!(f, "updated"),
            Phase::Unchanged => write!(f, "unchanged"),
            Phase::Deleted => write!(f, "deleted"),
            Phase::Failed(err) => write!(f, "failed: {}", err),
            Phase::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceOutcome {
    pub urn: Urn,
    pub phase: Phase,
}

/// Result of `up`: what happened to each resource and the state to persist
#[derive(Debug, Clone)]
pub struct DeploymentSummary {
    /// Declared resources in declaration order, then deletions
    pub outcomes: Vec<ResourceOutcome>,
    pub state: DeploymentState,
}

impl DeploymentSummary {
    /// First failure, or `Cancelled` if anything was cancelled
    pub fn check(&self) -> Result<()> {
        let failure = self.outcomes.iter().find_map(|outcome| match &outcome.phase {
            Phase::Failed(err) => Some(err),
            _ => None,
        });
        if let Some(err) = failure {
            return Err(err.clone());
        }
        if self.outcomes.iter().any(|o| o.phase == Phase::Cancelled) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    pub fn phase(&self, urn: &Urn) -> Option<&Phase> {
        self.outcomes
            .iter()
            .find(|outcome| &outcome.urn == urn)
            .map(|outcome| &outcome.phase)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ResourceOutcome> {
        self.outcomes.iter().filter(|o| !o.phase.is_success())
    }
}

/// Live view of a recorded resource
#[derive(Debug, Clone, PartialEq)]
pub enum LiveStatus {
    Present {
        id: Option<String>,
        outputs: PropertyMap,
    },
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshOutcome {
    pub urn: Urn,
    pub status: std::result::Result<LiveStatus, Error>,
}

struct Settled {
    phase: Phase,
    record: Option<ResourceRecord>,
}

fn provider_error(urn: &Urn, operation: Operation, fault: ProviderFault) -> Error {
    ResolutionError::Provider {
        urn: urn.clone(),
        operation: operation.to_string(),
        kind: fault.kind,
        message: fault.message,
    }
    .into()
}

fn take<T>(slot: Mutex<Option<T>>) -> Option<T> {
    slot.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn store<T>(slot: &Mutex<Option<T>>, value: T) {
    match slot.lock() {
        Ok(mut guard) => *guard = Some(value),
        Err(poisoned) => *poisoned.into_inner() = Some(value),
    }
}

/// Resolves once `up` is cancelled; never if the handle can no longer fire
async fn cancelled(mut rx: watch::Receiver<bool>) {
    let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

struct Engine<'a> {
    nodes: &'a [ResourceNode],
    registry: &'a Registry,
    runtime: &'a dyn ProviderRuntime,
    prior: &'a HashMap<Urn, ResourceRecord>,
    /// Provider variables sent with `configure` for this run
    variables: &'a BTreeMap<String, String>,
    /// Recorded resources no longer declared, newest first
    orphans: &'a [ResourceRecord],
    results: Vec<Mutex<Option<Settled>>>,
    deletions: Vec<Mutex<Option<Phase>>>,
}

impl<'a> Engine<'a> {
    fn new(
        nodes: &'a [ResourceNode],
        registry: &'a Registry,
        runtime: &'a dyn ProviderRuntime,
        prior: &'a HashMap<Urn, ResourceRecord>,
        variables: &'a BTreeMap<String, String>,
        orphans: &'a [ResourceRecord],
    ) -> Self {
        Self {
            nodes,
            registry,
            runtime,
            prior,
            variables,
            orphans,
            results: nodes.iter().map(|_| Mutex::new(None)).collect(),
            deletions: orphans.iter().map(|_| Mutex::new(None)).collect(),
        }
    }

    async fn run(&self) {
        join_all((0..self.nodes.len()).map(|index| self.drive(index))).await;

        // Sequential so that later resources go before the ones they were built on.
        for (record, slot) in self.orphans.iter().zip(&self.deletions) {
            let phase = self.delete(record).await;
            store(slot, phase);
        }
    }

    async fn drive(&self, index: usize) {
        let node = &self.nodes[index];
        let settled = match self.submit(node).await {
            Ok((phase, record)) => {
                node.settler
                    .settle(OutputState::Resolved(record.outputs.clone()));
                Settled {
                    phase,
                    record: Some(record),
                }
            }
            Err(err) => {
                warn!("{} failed: {}", node.urn, err);
                node.settler.settle(OutputState::Failed(err.clone()));
                Settled {
                    phase: Phase::Failed(err),
                    record: None,
                }
            }
        };
        store(&self.results[index], settled);
    }

    async fn submit(&self, node: &ResourceNode) -> Result<(Phase, ResourceRecord)> {
        let mut upstream = HashMap::new();
        for &dependency in &node.dependencies {
            let dependency = &self.nodes[dependency];
            let mut rx = dependency.settler.subscribe();
            let settlement = match rx.wait_for(|s| s.is_settled()).await {
                Ok(settled) => (*settled).clone(),
                Err(_) => OutputState::Cancelled,
            };
            match settlement {
                OutputState::Resolved(outputs) => {
                    upstream.insert(dependency.urn.clone(), outputs);
                }
                _ => {
                    return Err(ResolutionError::DependencyFailed {
                        urn: node.urn.clone(),
                        dependency: dependency.urn.clone(),
                    }
                    .into())
                }
            }
        }

        let inputs = node.descriptor.resolve_inputs(&upstream)?;
        let type_tag = node.descriptor.type_tag.clone();
        let prior = self.prior.get(&node.urn);

        let (phase, request) = match prior {
            None => (
                Phase::Created,
                ProviderRequest::create(type_tag.clone(), node.urn.clone(), inputs.clone()),
            ),
            Some(record) if record.inputs == inputs && record.config == *self.variables => {
                debug!("{} is unchanged", node.urn);
                return Ok((Phase::Unchanged, record.clone()));
            }
            Some(record) => {
                if record.inputs == inputs {
                    info!("Provider configuration changed, {} will be replaced", node.urn);
                }
                (
                    Phase::Updated,
                    ProviderRequest::update(
                        type_tag.clone(),
                        node.urn.clone(),
                        record.id.clone(),
                        record.inputs.clone(),
                        inputs.clone(),
                    ),
                )
            }
        };

        let operation = request.operation;
        info!("Submitting {} of {}...", operation, node.urn);
        let (id, outputs) = match self.runtime.dispatch(request).await? {
            ProviderResponse::Ok { id, outputs } => (id, outputs),
            ProviderResponse::Error(fault) => {
                if let Some(record) = prior {
                    // A replacing runtime may have removed the old resource before failing.
                    warn!(
                        "Update of {} failed; keeping its record ({}) so the next run retries it",
                        node.urn,
                        record.id.as_deref().unwrap_or("no id")
                    );
                }
                return Err(provider_error(&node.urn, operation, fault));
            }
        };

        if let Some(schema) = self.registry.schema(&type_tag) {
            if let Some(key) = schema
                .outputs
                .iter()
                .find(|key| !outputs.contains_key(key.as_str()))
            {
                return Err(ResolutionError::MissingOutput {
                    urn: node.urn.clone(),
                    key: key.clone(),
                }
                .into());
            }
        }

        info!("✓ {} {}", node.urn, phase);
        Ok((
            phase,
            ResourceRecord {
                urn: node.urn.clone(),
                type_tag,
                name: node.descriptor.name.clone(),
                id: id.or_else(|| prior.and_then(|record| record.id.clone())),
                inputs,
                outputs,
                config: self.variables.clone(),
            },
        ))
    }

    async fn delete(&self, record: &ResourceRecord) -> Phase {
        info!("Deleting {}...", record.urn);
        let request = ProviderRequest::delete(
            record.type_tag.clone(),
            record.urn.clone(),
            record.id.clone(),
            record.outputs.clone(),
        );

        match self.runtime.dispatch(request).await {
            Ok(ProviderResponse::Ok { .. }) => {
                info!("✓ {} deleted", record.urn);
                Phase::Deleted
            }
            Ok(ProviderResponse::Error(fault)) if fault.is_not_found() => {
                warn!("{} was already gone: {}", record.urn, fault.message);
                Phase::Deleted
            }
            Ok(ProviderResponse::Error(fault)) => {
                let err = provider_error(&record.urn, Operation::Delete, fault);
                warn!("{}", err);
                Phase::Failed(err)
            }
            Err(err) => {
                warn!("Failed to delete {}: {}", record.urn, err);
                Phase::Failed(err.into())
            }
        }
    }

    /// Outcomes plus the state to record. Resources that were not replaced
    /// by a fresh record keep their previous one.
    fn finish(self, deployment: &str, prior_records: &[ResourceRecord]) -> DeploymentSummary {
        let mut outcomes = Vec::new();
        let mut resources = Vec::new();

        let deletions: Vec<(&ResourceRecord, Phase)> = self
            .orphans
            .iter()
            .zip(self.deletions)
            .map(|(record, slot)| (record, take(slot).unwrap_or(Phase::Cancelled)))
            .collect();
        let deleted: HashSet<&Urn> = deletions
            .iter()
            .filter(|(_, phase)| *phase == Phase::Deleted)
            .map(|(record, _)| &record.urn)
            .collect();
        let declared: HashSet<&Urn> = self.nodes.iter().map(|node| &node.urn).collect();

        resources.extend(
            prior_records
                .iter()
                .filter(|r| !declared.contains(&r.urn) && !deleted.contains(&r.urn))
                .cloned(),
        );

        for (node, slot) in self.nodes.iter().zip(self.results) {
            let settled = take(slot).unwrap_or(Settled {
                phase: Phase::Cancelled,
                record: None,
            });
            if let Some(record) = settled
                .record
                .or_else(|| self.prior.get(&node.urn).cloned())
            {
                resources.push(record);
            }
            outcomes.push(ResourceOutcome {
                urn: node.urn.clone(),
                phase: settled.phase,
            });
        }

        outcomes.extend(deletions.into_iter().map(|(record, phase)| ResourceOutcome {
            urn: record.urn.clone(),
            phase,
        }));

        DeploymentSummary {
            outcomes,
            state: DeploymentState {
                deployment: deployment.to_string(),
                updated_at: chrono::Utc::now(),
                resources,
            },
        }
    }
}

impl Deployment {
    /// Submit every declared resource and reconcile against the prior state.
    ///
    /// Returns `Err` only when the runtime cannot be configured; per-resource
    /// failures are reported in the summary and through the outputs.
    pub async fn up(self, runtime: &dyn ProviderRuntime) -> Result<DeploymentSummary> {
        let Deployment {
            name,
            registry,
            provider_config,
            nodes,
            prior,
            cancel,
            ..
        } = self;
        info!("Deploying {} ({} resources declared)", name, nodes.len());

        let variables = provider_config.to_variables();
        if let Err(err) = runtime.configure(&variables).await {
            let err = Error::from(err);
            warn!("Failed to configure provider runtime: {}", err);
            for node in &nodes {
                node.settler.settle(OutputState::Failed(err.clone()));
            }
            return Err(err);
        }

        let prior_records = prior.map(|state| state.resources).unwrap_or_default();
        let declared: HashSet<&Urn> = nodes.iter().map(|node| &node.urn).collect();
        let orphans: Vec<ResourceRecord> = prior_records
            .iter()
            .rev()
            .filter(|record| !declared.contains(&record.urn))
            .cloned()
            .collect();
        let prior: HashMap<Urn, ResourceRecord> = prior_records
            .iter()
            .map(|record| (record.urn.clone(), record.clone()))
            .collect();

        let engine = Engine::new(&nodes, &registry, runtime, &prior, &variables, &orphans);
        let was_cancelled = tokio::select! {
            _ = engine.run() => false,
            _ = cancelled(cancel.subscribe()) => true,
        };

        if was_cancelled {
            warn!("Deployment {} cancelled", name);
            for node in &nodes {
                node.settler.settle(OutputState::Cancelled);
            }
        }

        let summary = engine.finish(&name, &prior_records);
        let failed = summary.failures().count();
        if failed == 0 {
            info!("✓ Deployment {} finished ({} resources)", name, summary.outcomes.len());
        } else {
            warn!(
                "Deployment {} finished with {} of {} resources failed or cancelled",
                name,
                failed,
                summary.outcomes.len()
            );
        }
        Ok(summary)
    }
}

/// Read every recorded resource concurrently
pub async fn refresh(
    runtime: &dyn ProviderRuntime,
    config: &ProviderConfig,
    state: &DeploymentState,
) -> Result<Vec<RefreshOutcome>> {
    runtime.configure(&config.to_variables()).await?;

    let reads = state.resources.iter().map(|record| async move {
        let request = ProviderRequest::read(
            record.type_tag.clone(),
            record.urn.clone(),
            record.id.clone(),
            record.inputs.clone(),
        );
        let status = match runtime.dispatch(request).await {
            Ok(ProviderResponse::Ok { id, outputs }) => Ok(LiveStatus::Present { id, outputs }),
            Ok(ProviderResponse::Error(fault)) if fault.is_not_found() => Ok(LiveStatus::Missing),
            Ok(ProviderResponse::Error(fault)) => {
                Err(provider_error(&record.urn, Operation::Read, fault))
            }
            Err(err) => Err(err.into()),
        };
        RefreshOutcome {
            urn: record.urn.clone(),
            status,
        }
    });

    Ok(join_all(reads).await)
}
