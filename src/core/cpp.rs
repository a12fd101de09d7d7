use serde::{Deserialize, Serialize};

use super::error::{EngineError, EngineResult};
use super::tables::{BenefitTables, CppParams};
use super::types::{BenefitEstimate, CPP_MAX_START_AGE, CPP_MIN_START_AGE, CppHistory};

const STANDARD_START_AGE: u32 = 65;
const EARLY_REDUCTION_PER_MONTH: f64 = 0.006;
const LATE_INCREASE_PER_MONTH: f64 = 0.007;

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistorySummary {
    pub average_indexed_earnings: f64,
    pub contributory_years: f64,
    #[serde(default)]
    pub dropped_years: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgeCandidate {
    pub age: u32,
    pub annual_amount: f64,
    pub lifetime_value: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimalAge {
    pub optimal_age: u32,
    pub lifetime_value: f64,
    pub candidates: Vec<AgeCandidate>,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BreakEven {
    pub early_age: u32,
    pub late_age: u32,
    pub early_annual: f64,
    pub late_annual: f64,
    pub break_even_age: Option<u32>,
}

fn validate_start_age(start_age: u32) -> EngineResult<()> {
    if !(CPP_MIN_START_AGE..=CPP_MAX_START_AGE).contains(&start_age) {
        return Err(EngineError::invalid(
            "cpp_start_age",
            format!("must be between {CPP_MIN_START_AGE} and {CPP_MAX_START_AGE}, got {start_age}"),
        ));
    }
    Ok(())
}

fn validate_non_negative(field: &str, value: f64) -> EngineResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(EngineError::invalid(
            field,
            format!("must be a finite non-negative number, got {value}"),
        ));
    }
    Ok(())
}

pub fn adjustment_factor(start_age: u32) -> EngineResult<f64> {
    validate_start_age(start_age)?;
    let factor = if start_age < STANDARD_START_AGE {
        let months_early = ((STANDARD_START_AGE - start_age) * 12) as f64;
        1.0 - EARLY_REDUCTION_PER_MONTH * months_early
    } else {
        let months_late = ((start_age - STANDARD_START_AGE) * 12) as f64;
        1.0 + LATE_INCREASE_PER_MONTH * months_late
    };
    Ok(factor)
}

pub fn summarize_history(history: &CppHistory, params: &CppParams) -> EngineResult<HistorySummary> {
    match history {
        CppHistory::Summary {
            average_indexed_earnings,
            contributory_years,
        } => {
            validate_non_negative("average_indexed_earnings", *average_indexed_earnings)?;
            validate_non_negative("contributory_years", *contributory_years)?;
            Ok(HistorySummary {
                average_indexed_earnings: *average_indexed_earnings,
                contributory_years: *contributory_years,
                dropped_years: 0,
            })
        }
        CppHistory::Records(records) => {
            let mut capped = Vec::with_capacity(records.len());
            for record in records {
                validate_non_negative("pensionable_earnings", record.pensionable_earnings)?;
                capped.push(record.pensionable_earnings.min(params.ympe));
            }
            if capped.is_empty() {
                return Ok(HistorySummary {
                    average_indexed_earnings: 0.0,
                    contributory_years: 0.0,
                    dropped_years: 0,
                });
            }

            capped.sort_by(|a, b| a.total_cmp(b));
            let dropped = (params.dropout_fraction * capped.len() as f64).floor() as usize;
            let dropped = dropped.min(capped.len() - 1);
            let retained = &capped[dropped..];

            // Zero years reduce the years factor only, not the earnings average.
            let contributory = retained.iter().filter(|&&e| e > 0.0).count();
            let average = if contributory == 0 {
                0.0
            } else {
                retained.iter().sum::<f64>() / contributory as f64
            };

            Ok(HistorySummary {
                average_indexed_earnings: average,
                contributory_years: contributory as f64,
                dropped_years: dropped as u32,
            })
        }
    }
}

pub fn base_monthly_at_65(average_indexed_earnings: f64, years: f64, params: &CppParams) -> f64 {
    if params.ympe <= 0.0 || params.full_contributory_years <= 0.0 {
        return 0.0;
    }
    let earnings_ratio = (average_indexed_earnings / params.ympe).min(1.0);
    let years_ratio = (years / params.full_contributory_years).min(1.0);
    params.max_monthly_at_65 * earnings_ratio * years_ratio
}

pub fn estimate_cpp(
    average_indexed_earnings: f64,
    years_of_contribution: f64,
    start_age: u32,
    current_age: u32,
    tables: &BenefitTables,
) -> EngineResult<BenefitEstimate> {
    validate_non_negative("average_indexed_earnings", average_indexed_earnings)?;
    validate_non_negative("years_of_contribution", years_of_contribution)?;
    let factor = adjustment_factor(start_age)?;

    let base_monthly =
        base_monthly_at_65(average_indexed_earnings, years_of_contribution, &tables.cpp);
    let monthly = base_monthly * factor;
    tracing::debug!(
        start_age,
        current_age,
        base_monthly,
        factor,
        "estimated CPP retirement pension"
    );

    Ok(BenefitEstimate {
        monthly_amount: monthly,
        annual_amount: monthly * 12.0,
        gross_annual_amount: base_monthly * 12.0,
        adjustment_factor: factor,
        clawback_amount: 0.0,
        eligible: true,
        reason: None,
    })
}

pub fn estimate_cpp_from_history(
    history: &CppHistory,
    start_age: u32,
    current_age: u32,
    tables: &BenefitTables,
) -> EngineResult<BenefitEstimate> {
    let summary = summarize_history(history, &tables.cpp)?;
    estimate_cpp(
        summary.average_indexed_earnings,
        summary.contributory_years,
        start_age,
        current_age,
        tables,
    )
}

fn annual_at(summary: &HistorySummary, start_age: u32, tables: &BenefitTables) -> EngineResult<f64> {
    let estimate = estimate_cpp(
        summary.average_indexed_earnings,
        summary.contributory_years,
        start_age,
        start_age,
        tables,
    )?;
    Ok(estimate.annual_amount)
}

fn lifetime_value(
    annual: f64,
    start_age: u32,
    life_expectancy: f64,
    discount: Option<(f64, u32)>,
) -> f64 {
    let years = (life_expectancy - start_age as f64).max(0.0);
    let Some((rate, current_age)) = discount else {
        return annual * years;
    };

    let full_years = years.floor() as u32;
    let partial = years - full_years as f64;
    let discount_at = |age: u32| {
        let periods = age.saturating_sub(current_age) as f64;
        (1.0 + rate).powf(periods)
    };

    let mut total = 0.0;
    for k in 0..full_years {
        total += annual / discount_at(start_age + k);
    }
    if partial > 0.0 {
        total += annual * partial / discount_at(start_age + full_years);
    }
    total
}

pub fn find_optimal_cpp_start_age(
    summary: &HistorySummary,
    life_expectancy: f64,
    discount_rate: Option<f64>,
    current_age: u32,
    tables: &BenefitTables,
) -> EngineResult<OptimalAge> {
    if !life_expectancy.is_finite() || life_expectancy <= 0.0 {
        return Err(EngineError::invalid(
            "life_expectancy",
            format!("must be a positive age, got {life_expectancy}"),
        ));
    }
    if let Some(rate) = discount_rate.filter(|r| !r.is_finite() || *r <= -1.0) {
        return Err(EngineError::invalid(
            "discount_rate",
            format!("must be greater than -1, got {rate}"),
        ));
    }

    let discount = discount_rate.map(|r| (r, current_age));
    let mut candidates = Vec::with_capacity((CPP_MAX_START_AGE - CPP_MIN_START_AGE + 1) as usize);
    for age in CPP_MIN_START_AGE..=CPP_MAX_START_AGE {
        let annual_amount = annual_at(summary, age, tables)?;
        candidates.push(AgeCandidate {
            age,
            annual_amount,
            lifetime_value: lifetime_value(annual_amount, age, life_expectancy, discount),
        });
    }

    let mut best = candidates[0];
    for candidate in &candidates[1..] {
        if candidate.lifetime_value > best.lifetime_value {
            best = *candidate;
        }
    }

    Ok(OptimalAge {
        optimal_age: best.age,
        lifetime_value: best.lifetime_value,
        candidates,
    })
}

pub fn calculate_break_even_age(
    summary: &HistorySummary,
    age_a: u32,
    age_b: u32,
    horizon_age: u32,
    tables: &BenefitTables,
) -> EngineResult<BreakEven> {
    let early_age = age_a.min(age_b);
    let late_age = age_a.max(age_b);
    let early_annual = annual_at(summary, early_age, tables)?;
    let late_annual = annual_at(summary, late_age, tables)?;

    let mut break_even_age = None;
    if early_age != late_age {
        for age in late_age..=horizon_age {
            let early_total = early_annual * (age - early_age) as f64;
            let late_total = late_annual * (age - late_age) as f64;
            if late_total > early_total {
                break_even_age = Some(age);
                break;
            }
        }
    }

    Ok(BreakEven {
        early_age,
        late_age,
        early_annual,
        late_annual,
        break_even_age,
    })
}
