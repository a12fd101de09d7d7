use std::thread;

use serde::{Deserialize, Serialize};

use super::engine::run_projection;
use super::error::{EngineError, EngineResult};
use super::tables::BenefitTableSet;
use super::types::{Household, ProjectionSummary, Strategy};

const TIER_SPREAD: f64 = 0.02;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnTier {
    Pessimistic,
    #[default]
    Neutral,
    Optimistic,
}

impl ReturnTier {
    pub const ALL: [ReturnTier; 3] = [
        ReturnTier::Pessimistic,
        ReturnTier::Neutral,
        ReturnTier::Optimistic,
    ];

    pub fn return_shift(self) -> f64 {
        match self {
            ReturnTier::Pessimistic => -TIER_SPREAD,
            ReturnTier::Neutral => 0.0,
            ReturnTier::Optimistic => TIER_SPREAD,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReturnTier::Pessimistic => "pessimistic",
            ReturnTier::Neutral => "neutral",
            ReturnTier::Optimistic => "optimistic",
        }
    }
}

pub fn apply_return_tier(household: &Household, tier: ReturnTier) -> Household {
    let mut adjusted = household.clone();
    for person in &mut adjusted.people {
        person.returns = person.returns.shifted(tier.return_shift());
    }
    adjusted
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: u32,
    pub name: String,
    pub household: Household,
    pub strategy: Strategy,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub id: u32,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<ProjectionSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub failure: Option<EngineError>,
}

fn run_one(scenario: &Scenario, tables: &BenefitTableSet) -> ScenarioResult {
    let (summary, failure) = match run_projection(&scenario.household, &scenario.strategy, tables) {
        Ok(summary) => (Some(summary), None),
        Err(err) => {
            tracing::warn!(id = scenario.id, name = %scenario.name, %err, "scenario rejected");
            (None, Some(err))
        }
    };
    ScenarioResult {
        id: scenario.id,
        name: scenario.name.clone(),
        summary,
        error: failure.as_ref().map(ToString::to_string),
        failure,
    }
}

pub fn run_scenarios(scenarios: &[Scenario], tables: &BenefitTableSet) -> Vec<ScenarioResult> {
    if scenarios.is_empty() {
        return Vec::new();
    }
    let workers = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(scenarios.len());
    let chunk_size = scenarios.len().div_ceil(workers).max(1);

    let mut results = thread::scope(|scope| {
        let handles: Vec<_> = scenarios
            .chunks(chunk_size)
            .map(|chunk| {
                scope.spawn(move || chunk.iter().map(|s| run_one(s, tables)).collect::<Vec<_>>())
            })
            .collect();

        let mut merged = Vec::with_capacity(scenarios.len());
        for (handle, chunk) in handles.into_iter().zip(scenarios.chunks(chunk_size)) {
            match handle.join() {
                Ok(batch) => merged.extend(batch),
                Err(_) => merged.extend(chunk.iter().map(|s| ScenarioResult {
                    id: s.id,
                    name: s.name.clone(),
                    summary: None,
                    error: Some(EngineError::WorkerPanic.to_string()),
                    failure: Some(EngineError::WorkerPanic),
                })),
            }
        }
        merged
    });

    results.sort_by_key(|r| r.id);
    results
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TierComparison {
    pub tier: ReturnTier,
    pub return_shift: f64,
    pub summary: ProjectionSummary,
}

pub fn compare_return_tiers(
    household: &Household,
    strategy: &Strategy,
    tables: &BenefitTableSet,
) -> EngineResult<Vec<TierComparison>> {
    let scenarios: Vec<Scenario> = ReturnTier::ALL
        .iter()
        .enumerate()
        .map(|(i, &tier)| Scenario {
            id: i as u32,
            name: tier.as_str().to_string(),
            household: apply_return_tier(household, tier),
            strategy: strategy.clone(),
        })
        .collect();

    let mut comparisons = Vec::with_capacity(scenarios.len());
    for (result, tier) in run_scenarios(&scenarios, tables).into_iter().zip(ReturnTier::ALL) {
        let Some(summary) = result.summary else {
            return Err(result.failure.unwrap_or(EngineError::WorkerPanic));
        };
        comparisons.push(TierComparison {
            tier,
            return_shift: tier.return_shift(),
            summary,
        });
    }
    Ok(comparisons)
}
