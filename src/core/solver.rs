use serde::{Deserialize, Serialize};

use super::engine::run_projection;
use super::error::{EngineError, EngineResult};
use super::tables::BenefitTableSet;
use super::types::{CPP_MAX_START_AGE, CPP_MIN_START_AGE, ClaimingAges, Household, Strategy};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClaimingCandidate {
    pub cpp_start_age: u32,
    pub oas_start_age: u32,
    pub success: bool,
    pub years_funded: u32,
    pub final_estate_real: f64,
    pub total_tax: f64,
    pub health_score: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimingSearchResult {
    pub person_index: usize,
    pub best: ClaimingCandidate,
    pub candidates: Vec<ClaimingCandidate>,
    pub message: String,
}

fn ranks_above(candidate: &ClaimingCandidate, incumbent: &ClaimingCandidate) -> bool {
    match (candidate.success, incumbent.success) {
        (true, false) => true,
        (false, true) => false,
        _ => candidate.final_estate_real > incumbent.final_estate_real,
    }
}

pub fn optimize_claiming_ages(
    household: &Household,
    strategy: &Strategy,
    person_index: usize,
    tables: &BenefitTableSet,
) -> EngineResult<ClaimingSearchResult> {
    let Some(person) = household.people.get(person_index) else {
        return Err(EngineError::invalid(
            "person_index",
            format!(
                "household has {} people, got index {person_index}",
                household.people.len()
            ),
        ));
    };
    let base_claiming = strategy.claiming_for(person_index, person);

    let mut candidates = Vec::with_capacity((CPP_MAX_START_AGE - CPP_MIN_START_AGE + 1) as usize);
    for cpp_start_age in CPP_MIN_START_AGE..=CPP_MAX_START_AGE {
        let mut trial = strategy.clone();
        if trial.claiming_overrides.len() <= person_index {
            trial.claiming_overrides.resize(person_index + 1, None);
        }
        trial.claiming_overrides[person_index] = Some(ClaimingAges {
            cpp_start_age,
            oas_start_age: base_claiming.oas_start_age,
        });

        let summary = run_projection(household, &trial, tables)?;
        candidates.push(ClaimingCandidate {
            cpp_start_age,
            oas_start_age: base_claiming.oas_start_age,
            success: summary.success,
            years_funded: summary.years_funded,
            final_estate_real: summary.final_estate_real,
            total_tax: summary.total_tax,
            health_score: summary.health_score,
        });
    }

    let mut best = candidates[0];
    for candidate in &candidates[1..] {
        if ranks_above(candidate, &best) {
            best = *candidate;
        }
    }

    let message = if best.success {
        format!(
            "starting CPP at {} keeps the plan funded with the largest estate",
            best.cpp_start_age
        )
    } else {
        format!(
            "no CPP start age fully funds the plan; {} leaves the largest estate",
            best.cpp_start_age
        )
    };
    tracing::info!(person_index, best_age = best.cpp_start_age, success = best.success, "claiming search finished");

    Ok(ClaimingSearchResult {
        person_index,
        best,
        candidates,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{
        AccountReturns, CppHistory, MaritalStatus, Person, Province, SpendingSchedule,
    };

    fn household(age: u32, end_age: u32, tfsa: f64) -> Household {
        let mut person = Person::new("A", age);
        person.cpp_history = CppHistory::Summary {
            average_indexed_earnings: 71_300.0,
            contributory_years: 39.0,
        };
        person.years_in_canada = 0;
        person.balances.tfsa = tfsa;
        person.returns = AccountReturns::default().shifted(-0.05);
        Household {
            people: vec![person],
            province: Province::Alberta,
            marital_status: MaritalStatus::Single,
            start_year: 2025,
            end_age,
            general_inflation: 0.0,
        }
    }

    fn plan(spending: f64) -> Strategy {
        Strategy::named("tfsa-first", SpendingSchedule::flat(spending, 0.0)).expect("preset")
    }

    #[test]
    fn search_covers_every_cpp_age_in_order() {
        let result = optimize_claiming_ages(&household(58, 90, 2_000_000.0), &plan(40_000.0), 0, &BenefitTableSet::builtin())
            .expect("search");
        let ages: Vec<u32> = result.candidates.iter().map(|c| c.cpp_start_age).collect();
        assert_eq!(ages, (60..=70).collect::<Vec<_>>());
        assert!(result.candidates.iter().all(|c| c.oas_start_age == 65));
    }

    #[test]
    fn long_horizon_with_ample_assets_prefers_late_claim() {
        let result = optimize_claiming_ages(&household(58, 100, 3_000_000.0), &plan(30_000.0), 0, &BenefitTableSet::builtin())
            .expect("search");
        assert!(result.best.success);
        assert!(result.best.cpp_start_age >= 66);
    }

    #[test]
    fn short_horizon_prefers_early_claim() {
        let result = optimize_claiming_ages(&household(60, 66, 1_000_000.0), &plan(20_000.0), 0, &BenefitTableSet::builtin())
            .expect("search");
        assert_eq!(result.best.cpp_start_age, 60);
    }

    #[test]
    fn funded_plan_outranks_larger_unfunded_estate() {
        let funded = ClaimingCandidate {
            cpp_start_age: 62,
            oas_start_age: 65,
            success: true,
            years_funded: 30,
            final_estate_real: 10.0,
            total_tax: 0.0,
            health_score: 100,
        };
        let unfunded = ClaimingCandidate {
            success: false,
            final_estate_real: 1_000_000.0,
            ..funded
        };
        assert!(ranks_above(&funded, &unfunded));
        assert!(!ranks_above(&unfunded, &funded));
        assert!(!ranks_above(&funded, &funded));
    }

    #[test]
    fn out_of_range_person_is_rejected() {
        let err = optimize_claiming_ages(&household(60, 80, 0.0), &plan(1.0), 3, &BenefitTableSet::builtin())
            .expect_err("bad index");
        assert!(matches!(err, EngineError::InputValidation { .. }));
    }
}
