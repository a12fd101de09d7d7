use serde::{Deserialize, Serialize};

use super::tables::{BenefitTables, TaxSchedule};
use super::types::Province;

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaxBreakdown {
    pub federal: f64,
    pub provincial: f64,
    pub total: f64,
}

pub fn schedule_tax(taxable_income: f64, schedule: &TaxSchedule) -> f64 {
    let income = taxable_income.max(0.0);
    let mut tax = 0.0;
    for (i, bracket) in schedule.brackets.iter().enumerate() {
        if income <= bracket.threshold {
            break;
        }
        let upper = schedule
            .brackets
            .get(i + 1)
            .map(|next| next.threshold)
            .unwrap_or(f64::INFINITY);
        tax += (income.min(upper) - bracket.threshold) * bracket.rate;
    }
    let credit = schedule.basic_personal_amount * schedule.lowest_rate();
    (tax - credit).max(0.0)
}

pub fn income_tax(taxable_income: f64, province: Province, tables: &BenefitTables) -> TaxBreakdown {
    let mut federal = schedule_tax(taxable_income, &tables.tax.federal);
    if province == Province::Quebec {
        federal *= 1.0 - tables.tax.quebec_abatement;
    }
    let provincial = schedule_tax(taxable_income, tables.tax.provincial(province));
    TaxBreakdown {
        federal,
        provincial,
        total: federal + provincial,
    }
}

pub fn total_income_tax(taxable_income: f64, province: Province, tables: &BenefitTables) -> f64 {
    income_tax(taxable_income, province, tables).total
}

pub fn marginal_rate(taxable_income: f64, province: Province, tables: &BenefitTables) -> f64 {
    let base = total_income_tax(taxable_income, province, tables);
    total_income_tax(taxable_income + 1.0, province, tables) - base
}

pub fn effective_rate(taxable_income: f64, province: Province, tables: &BenefitTables) -> f64 {
    if taxable_income <= 0.0 {
        return 0.0;
    }
    total_income_tax(taxable_income, province, tables) / taxable_income
}

pub fn taxable_capital_gain(realized_gain: f64, tables: &BenefitTables) -> f64 {
    realized_gain.max(0.0) * tables.tax.capital_gains_inclusion
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
    fn income_below_personal_amount_is_untaxed() {
        let tables = BenefitTables::year_2025();
        let tax = income_tax(12_000.0, Province::Ontario, &tables);
        assert_eq!(tax.total, 0.0);
    }

    #[test]
    fn federal_tax_spans_brackets() {
        let tables = BenefitTables::year_2025();
        let federal = schedule_tax(80_000.0, &tables.tax.federal);
        let expected = 57_375.0 * 0.15 + (80_000.0 - 57_375.0) * 0.205 - 16_129.0 * 0.15;
        assert_approx(federal, expected);
    }

    #[test]
    fn quebec_residents_get_federal_abatement() {
        let tables = BenefitTables::year_2025();
        let on = income_tax(60_000.0, Province::Ontario, &tables);
        let qc = income_tax(60_000.0, Province::Quebec, &tables);
        assert_approx(qc.federal, on.federal * (1.0 - 0.165));
        assert_approx(qc.total, qc.federal + qc.provincial);
    }

    #[test]
    fn capital_gains_use_half_inclusion() {
        let tables = BenefitTables::year_2025();
        assert_approx(taxable_capital_gain(10_000.0, &tables), 5_000.0);
        assert_eq!(taxable_capital_gain(-500.0, &tables), 0.0);
    }

    #[test]
    fn marginal_rate_in_top_ontario_bracket() {
        let tables = BenefitTables::year_2025();
        let rate = marginal_rate(400_000.0, Province::Ontario, &tables);
        assert!((rate - (0.33 + 0.1316)).abs() < 1e-6);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(64))]

        #[test]
        fn prop_tax_is_monotone_and_below_income(
            income in 0u32..500_000,
            extra in 1u32..50_000,
            province_idx in 0usize..4,
        ) {
            let tables = BenefitTables::year_2025();
            let province = [Province::Ontario, Province::BritishColumbia, Province::Alberta, Province::Quebec][province_idx];
            let low = total_income_tax(income as f64, province, &tables);
            let high = total_income_tax((income + extra) as f64, province, &tables);
            prop_assert!(low >= 0.0);
            prop_assert!(high >= low);
            prop_assert!(low <= income as f64);
        }
    }
}
