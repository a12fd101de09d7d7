use super::error::{EngineError, EngineResult};
use super::tables::{BenefitTables, OasParams};
use super::types::{BenefitEstimate, OAS_MAX_START_AGE, OAS_MIN_START_AGE};

pub fn residency_ratio(years_in_canada: u32, params: &OasParams) -> f64 {
    if params.full_residency_years == 0 {
        return 1.0;
    }
    years_in_canada.min(params.full_residency_years) as f64 / params.full_residency_years as f64
}

pub fn deferral_factor(deferral_months: u32, params: &OasParams) -> f64 {
    1.0 + params.deferral_rate_per_month * deferral_months.min(params.max_deferral_months) as f64
}

pub fn oas_clawback(gross_annual: f64, net_world_income: f64, params: &OasParams) -> f64 {
    let excess = (net_world_income - params.clawback_threshold).max(0.0);
    (excess * params.recovery_rate).min(gross_annual.max(0.0))
}

pub fn gross_annual_oas(years_in_canada: u32, start_age: u32, age: u32, params: &OasParams) -> f64 {
    if age < start_age || age < OAS_MIN_START_AGE || years_in_canada < params.min_residency_years {
        return 0.0;
    }
    let months_deferred = start_age.saturating_sub(OAS_MIN_START_AGE) * 12;
    let mut annual = params.max_monthly
        * 12.0
        * residency_ratio(years_in_canada, params)
        * deferral_factor(months_deferred, params);
    if age >= 75 {
        annual *= 1.0 + params.age_75_bonus;
    }
    annual
}

fn residency_gate(years_in_canada: u32, params: &OasParams) -> Option<BenefitEstimate> {
    (years_in_canada < params.min_residency_years).then(|| {
        BenefitEstimate::ineligible(format!(
            "requires at least {} years of residence in Canada after age 18, has {years_in_canada}",
            params.min_residency_years
        ))
    })
}

pub fn calculate_net_oas(
    years_in_canada: u32,
    net_world_income: f64,
    age: u32,
    tables: &BenefitTables,
) -> EngineResult<BenefitEstimate> {
    if !net_world_income.is_finite() {
        return Err(EngineError::invalid(
            "net_world_income",
            "must be a finite number",
        ));
    }
    let params = &tables.oas;
    if let Some(ineligible) = residency_gate(years_in_canada, params) {
        return Ok(ineligible);
    }
    if age < OAS_MIN_START_AGE {
        return Ok(BenefitEstimate::ineligible(format!(
            "OAS is payable from age {OAS_MIN_START_AGE}, current age is {age}"
        )));
    }

    let gross = gross_annual_oas(years_in_canada, OAS_MIN_START_AGE, age, params);
    let clawback = oas_clawback(gross, net_world_income, params);
    let annual = gross - clawback;

    Ok(BenefitEstimate {
        monthly_amount: annual / 12.0,
        annual_amount: annual,
        gross_annual_amount: gross,
        adjustment_factor: if age >= 75 { 1.0 + params.age_75_bonus } else { 1.0 },
        clawback_amount: clawback,
        eligible: true,
        reason: None,
    })
}

pub fn calculate_oas_deferral(
    years_in_canada: u32,
    deferral_months: u32,
    base_age: u32,
    tables: &BenefitTables,
) -> EngineResult<BenefitEstimate> {
    let params = &tables.oas;
    if base_age < OAS_MIN_START_AGE {
        return Err(EngineError::invalid(
            "base_age",
            format!("must be at least {OAS_MIN_START_AGE}, got {base_age}"),
        ));
    }
    if deferral_months > params.max_deferral_months {
        return Err(EngineError::invalid(
            "deferral_months",
            format!(
                "cannot exceed {} months, got {deferral_months}",
                params.max_deferral_months
            ),
        ));
    }
    if base_age * 12 + deferral_months > OAS_MAX_START_AGE * 12 {
        return Err(EngineError::invalid(
            "deferral_months",
            format!("deferral past age {OAS_MAX_START_AGE} is not allowed"),
        ));
    }
    if let Some(ineligible) = residency_gate(years_in_canada, params) {
        return Ok(ineligible);
    }

    let base = params.max_monthly * residency_ratio(years_in_canada, params);
    let factor = deferral_factor(deferral_months, params);
    let monthly = base * factor;

    Ok(BenefitEstimate {
        monthly_amount: monthly,
        annual_amount: monthly * 12.0,
        gross_annual_amount: monthly * 12.0,
        adjustment_factor: factor,
        clawback_amount: 0.0,
        eligible: true,
        reason: None,
    })
}
