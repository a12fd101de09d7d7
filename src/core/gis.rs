use serde::{Deserialize, Serialize};

use super::error::{EngineError, EngineResult};
use super::tables::{BenefitTables, GisParams};
use super::types::{BenefitEstimate, Eligibility, MaritalStatus, OAS_MIN_START_AGE};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GisCategory {
    Single,
    CoupleBothOas,
    CoupleSpouseNoOas,
}

impl GisCategory {
    pub fn for_household(marital_status: MaritalStatus, spouse_receives_oas: bool) -> Self {
        match (marital_status.is_couple(), spouse_receives_oas) {
            (false, _) => GisCategory::Single,
            (true, true) => GisCategory::CoupleBothOas,
            (true, false) => GisCategory::CoupleSpouseNoOas,
        }
    }

    fn max_annual(self, params: &GisParams) -> f64 {
        let monthly = match self {
            GisCategory::Single => params.max_monthly_single,
            GisCategory::CoupleBothOas => params.max_monthly_couple_both_oas,
            GisCategory::CoupleSpouseNoOas => params.max_monthly_couple_spouse_no_oas,
        };
        monthly * 12.0
    }

    fn income_cutoff(self, params: &GisParams) -> f64 {
        match self {
            GisCategory::Single => params.income_cutoff_single,
            GisCategory::CoupleBothOas => params.income_cutoff_couple_both_oas,
            GisCategory::CoupleSpouseNoOas => params.income_cutoff_couple_spouse_no_oas,
        }
    }

    fn reduction_rate(self, params: &GisParams) -> f64 {
        match self {
            GisCategory::Single => params.reduction_rate_single,
            _ => params.reduction_rate_couple,
        }
    }
}

pub fn calculate_gis(
    countable_income: f64,
    marital_status: MaritalStatus,
    spouse_receives_oas: bool,
    tables: &BenefitTables,
) -> EngineResult<BenefitEstimate> {
    if !countable_income.is_finite() || countable_income < 0.0 {
        return Err(EngineError::invalid(
            "countable_income",
            format!("must be a finite non-negative number, got {countable_income}"),
        ));
    }
    let params = &tables.gis;
    let category = GisCategory::for_household(marital_status, spouse_receives_oas);
    let cutoff = category.income_cutoff(params);
    if countable_income >= cutoff {
        return Ok(BenefitEstimate::ineligible(format!(
            "countable income {countable_income:.2} is at or above the {cutoff:.2} cutoff"
        )));
    }

    let max_annual = category.max_annual(params);
    let reduction = (category.reduction_rate(params) * countable_income).min(max_annual);
    let annual = (max_annual - reduction).max(0.0);

    Ok(BenefitEstimate {
        monthly_amount: annual / 12.0,
        annual_amount: annual,
        gross_annual_amount: max_annual,
        adjustment_factor: 1.0,
        clawback_amount: reduction,
        eligible: annual > 0.0,
        reason: (annual <= 0.0).then(|| "income-tested amount is fully reduced".to_string()),
    })
}

pub fn is_eligible_for_gis(
    age: u32,
    receives_oas: bool,
    countable_income: f64,
    marital_status: MaritalStatus,
    spouse_receives_oas: bool,
    tables: &BenefitTables,
) -> Eligibility {
    if age < OAS_MIN_START_AGE {
        return Eligibility::denied(format!("must be at least {OAS_MIN_START_AGE}, age is {age}"));
    }
    if !receives_oas {
        return Eligibility::denied("must be receiving OAS");
    }
    let category = GisCategory::for_household(marital_status, spouse_receives_oas);
    let cutoff = category.income_cutoff(&tables.gis);
    if countable_income >= cutoff {
        return Eligibility::denied(format!(
            "countable income {countable_income:.2} is at or above the {cutoff:.2} cutoff"
        ));
    }
    Eligibility::eligible()
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncomeSource {
    Cpp,
    Oas,
    Tfsa,
    Employment,
    CapitalGains,
    Rrsp,
    Rrif,
    Lira,
    EmployerPension,
    Interest,
    Corporate,
    Other,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IncomeItem {
    pub source: IncomeSource,
    pub amount: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GisIncomeLine {
    pub source: IncomeSource,
    pub amount: f64,
    pub countable: f64,
    pub excluded: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GisIncome {
    pub total_gis_income: f64,
    pub excluded_income: f64,
    pub breakdown: Vec<GisIncomeLine>,
}

pub fn calculate_gis_income(items: &[IncomeItem], tables: &BenefitTables) -> EngineResult<GisIncome> {
    let params = &tables.gis;
    let mut cpp_exemption_left = params.cpp_exemption;
    let mut employment_full_left = params.employment_exemption_full;
    let mut employment_partial_left = params.employment_exemption_partial;

    let mut breakdown = Vec::with_capacity(items.len());
    for item in items {
        if !item.amount.is_finite() || item.amount < 0.0 {
            return Err(EngineError::invalid(
                "amount",
                format!("{:?} income must be finite and non-negative", item.source),
            ));
        }
        let amount = item.amount;
        let countable = match item.source {
            IncomeSource::Oas | IncomeSource::Tfsa => 0.0,
            IncomeSource::Cpp => {
                let exempt = amount.min(cpp_exemption_left);
                cpp_exemption_left -= exempt;
                amount - exempt
            }
            IncomeSource::Employment => {
                let fully_exempt = amount.min(employment_full_left);
                employment_full_left -= fully_exempt;
                let rest = amount - fully_exempt;
                let partial_band = rest.min(employment_partial_left);
                employment_partial_left -= partial_band;
                let partial_exempt = partial_band * params.employment_partial_rate;
                amount - fully_exempt - partial_exempt
            }
            IncomeSource::CapitalGains => amount * tables.tax.capital_gains_inclusion,
            _ => amount,
        };
        breakdown.push(GisIncomeLine {
            source: item.source,
            amount,
            countable,
            excluded: amount - countable,
        });
    }

    Ok(GisIncome {
        total_gis_income: breakdown.iter().map(|l| l.countable).sum(),
        excluded_income: breakdown.iter().map(|l| l.excluded).sum(),
        breakdown,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{prop_assert, proptest};

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= 1e-6,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn single_with_no_income_gets_maximum() {
        let tables = BenefitTables::year_2025();
        let gis = calculate_gis(0.0, MaritalStatus::Single, false, &tables).expect("gis");
        assert!(gis.eligible);
        assert_approx(gis.annual_amount, 1_086.88 * 12.0);
    }

    #[test]
    fn single_reduction_is_half_of_income() {
        let tables = BenefitTables::year_2025();
        let gis = calculate_gis(10_000.0, MaritalStatus::Widowed, true, &tables).expect("gis");
        assert_approx(gis.annual_amount, 1_086.88 * 12.0 - 5_000.0);
    }

    #[test]
    fn couple_category_follows_spouse_oas() {
        let tables = BenefitTables::year_2025();
        let both = calculate_gis(8_000.0, MaritalStatus::Married, true, &tables).expect("gis");
        assert_approx(both.annual_amount, 654.23 * 12.0 - 2_000.0);
        let no_oas =
            calculate_gis(8_000.0, MaritalStatus::CommonLaw, false, &tables).expect("gis");
        assert_approx(no_oas.annual_amount, 1_086.88 * 12.0 - 2_000.0);
    }

    #[test]
    fn income_at_cutoff_is_ineligible() {
        let tables = BenefitTables::year_2025();
        let gis = calculate_gis(22_056.0, MaritalStatus::Single, false, &tables).expect("gis");
        assert!(!gis.eligible);
        assert_eq!(gis.annual_amount, 0.0);
    }

    #[test]
    fn eligibility_names_failed_rule() {
        let tables = BenefitTables::year_2025();
        let young = is_eligible_for_gis(64, true, 0.0, MaritalStatus::Single, false, &tables);
        assert!(!young.eligible);
        assert!(young.reason.as_deref().is_some_and(|r| r.contains("64")));

        let no_oas = is_eligible_for_gis(70, false, 0.0, MaritalStatus::Single, false, &tables);
        assert_eq!(no_oas.reason.as_deref(), Some("must be receiving OAS"));

        let ok = is_eligible_for_gis(70, true, 5_000.0, MaritalStatus::Single, false, &tables);
        assert!(ok.eligible);
    }

    #[test]
    fn income_rules_exclude_and_exempt() {
        let tables = BenefitTables::year_2025();
        let items = [
            IncomeItem { source: IncomeSource::Oas, amount: 8_700.0 },
            IncomeItem { source: IncomeSource::Tfsa, amount: 3_000.0 },
            IncomeItem { source: IncomeSource::Cpp, amount: 9_000.0 },
            IncomeItem { source: IncomeSource::Employment, amount: 12_000.0 },
            IncomeItem { source: IncomeSource::Rrif, amount: 4_000.0 },
            IncomeItem { source: IncomeSource::CapitalGains, amount: 2_000.0 },
        ];
        let income = calculate_gis_income(&items, &tables).expect("income");
        // CPP 4,000 + employment 3,500 + RRIF 4,000 + gains 1,000
        assert_approx(income.total_gis_income, 12_500.0);
        assert_approx(
            income.total_gis_income + income.excluded_income,
            items.iter().map(|i| i.amount).sum(),
        );
        assert_eq!(income.breakdown.len(), items.len());
        assert_approx(income.breakdown[3].countable, 3_500.0);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(64))]

        #[test]
        fn prop_gis_is_zero_at_or_above_cutoff_and_never_negative(
            income in 0u32..80_000,
            couple in proptest::bool::ANY,
            spouse_oas in proptest::bool::ANY,
        ) {
            let tables = BenefitTables::year_2025();
            let status = if couple { MaritalStatus::Married } else { MaritalStatus::Single };
            let gis = calculate_gis(income as f64, status, spouse_oas, &tables).expect("gis");
            prop_assert!(gis.annual_amount >= 0.0);
            let cutoff = GisCategory::for_household(status, spouse_oas).income_cutoff(&tables.gis);
            if income as f64 >= cutoff {
                prop_assert!(gis.annual_amount == 0.0);
            }
        }
    }
}
