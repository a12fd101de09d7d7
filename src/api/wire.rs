use serde::{Deserialize, Serialize};

use crate::core::{
    AccountBalances, AccountKind, AccountReturns, ClaimingAges, CppHistory, EngineError,
    EngineResult, Household, IncomeItem, MaritalStatus, NumericFault, Person, ProjectionSummary,
    ProjectionYear, Province, ReturnTier, SpendingPhase, SpendingSchedule, Strategy,
};

pub const DEFAULT_START_YEAR: i32 = 2025;
pub const DEFAULT_END_AGE: u32 = 95;
const DEFAULT_STRATEGY: &str = "balanced";
const DEFAULT_INFLATION: f64 = 0.02;
const DEFAULT_GO_GO: f64 = 60_000.0;
const DEFAULT_GO_GO_END: u32 = 74;
const DEFAULT_SLOW_GO: f64 = 50_000.0;
const DEFAULT_SLOW_GO_END: u32 = 84;
const DEFAULT_NO_GO: f64 = 40_000.0;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonPayload {
    pub name: Option<String>,
    pub start_age: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birth_year: Option<i32>,
    pub cpp_start_age: Option<u32>,
    pub cpp_annual_at_start: Option<f64>,
    pub oas_start_age: Option<u32>,
    pub oas_annual_at_start: Option<f64>,
    pub years_in_canada: Option<u32>,

    pub rrsp_balance: Option<f64>,
    pub rrif_balance: Option<f64>,
    pub tfsa_balance: Option<f64>,
    pub lira_balance: Option<f64>,
    pub corporate_balance: Option<f64>,
    pub nr_cash: Option<f64>,
    pub nr_gic: Option<f64>,
    pub nr_invest: Option<f64>,
    pub nonreg_acb: Option<f64>,

    pub tfsa_room_annual: Option<f64>,
    pub employer_pension_annual: Option<f64>,
    pub pension_start_age: Option<u32>,
    pub other_income_annual: Option<f64>,
    pub prior_year_income: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior_year_sources: Option<Vec<IncomeItem>>,
    pub cpp_history: Option<CppHistory>,

    pub y_rrsp_growth: Option<f64>,
    pub y_rrif_growth: Option<f64>,
    pub y_tfsa_growth: Option<f64>,
    pub y_lira_growth: Option<f64>,
    pub y_corp_growth: Option<f64>,
    pub y_nr_cash_interest: Option<f64>,
    pub y_nr_gic_interest: Option<f64>,
    pub y_nr_inv_total_return: Option<f64>,
}

impl PersonPayload {
    pub fn into_person(self, label: &str) -> EngineResult<Person> {
        let start_age = self
            .start_age
            .ok_or_else(|| EngineError::invalid(&format!("{label}.start_age"), "is required"))?;
        let defaults = AccountReturns::default();
        let claiming = ClaimingAges::default();

        Ok(Person {
            name: self.name.unwrap_or_else(|| label.to_string()),
            current_age: start_age,
            birth_year: self.birth_year,
            cpp_history: self.cpp_history.unwrap_or_default(),
            years_in_canada: self.years_in_canada.unwrap_or(40),
            cpp_annual_at_start: self.cpp_annual_at_start,
            oas_annual_at_start: self.oas_annual_at_start,
            claiming: ClaimingAges {
                cpp_start_age: self.cpp_start_age.unwrap_or(claiming.cpp_start_age),
                oas_start_age: self.oas_start_age.unwrap_or(claiming.oas_start_age),
            },
            balances: AccountBalances {
                rrsp: self.rrsp_balance.unwrap_or(0.0),
                rrif: self.rrif_balance.unwrap_or(0.0),
                tfsa: self.tfsa_balance.unwrap_or(0.0),
                lira: self.lira_balance.unwrap_or(0.0),
                nonreg_cash: self.nr_cash.unwrap_or(0.0),
                nonreg_gic: self.nr_gic.unwrap_or(0.0),
                nonreg_invest: self.nr_invest.unwrap_or(0.0),
                nonreg_acb: self.nonreg_acb.or(self.nr_invest).unwrap_or(0.0),
                corporate: self.corporate_balance.unwrap_or(0.0),
            },
            returns: AccountReturns {
                rrsp: self.y_rrsp_growth.unwrap_or(defaults.rrsp),
                rrif: self.y_rrif_growth.unwrap_or(defaults.rrif),
                tfsa: self.y_tfsa_growth.unwrap_or(defaults.tfsa),
                lira: self.y_lira_growth.unwrap_or(defaults.lira),
                corporate: self.y_corp_growth.unwrap_or(defaults.corporate),
                nonreg_cash: self.y_nr_cash_interest.unwrap_or(defaults.nonreg_cash),
                nonreg_gic: self.y_nr_gic_interest.unwrap_or(defaults.nonreg_gic),
                nonreg_invest: self.y_nr_inv_total_return.unwrap_or(defaults.nonreg_invest),
            },
            employer_pension_annual: self.employer_pension_annual.unwrap_or(0.0),
            pension_start_age: self.pension_start_age.unwrap_or(0),
            other_income_annual: self.other_income_annual.unwrap_or(0.0),
            tfsa_room_annual: self.tfsa_room_annual,
            prior_year_income: self.prior_year_income,
            prior_year_sources: self.prior_year_sources.unwrap_or_default(),
        })
    }

    pub fn from_person(person: &Person) -> Self {
        let b = &person.balances;
        let r = &person.returns;
        Self {
            name: Some(person.name.clone()),
            start_age: Some(person.current_age),
            birth_year: person.birth_year,
            cpp_start_age: Some(person.claiming.cpp_start_age),
            cpp_annual_at_start: person.cpp_annual_at_start,
            oas_start_age: Some(person.claiming.oas_start_age),
            oas_annual_at_start: person.oas_annual_at_start,
            years_in_canada: Some(person.years_in_canada),
            rrsp_balance: Some(b.rrsp),
            rrif_balance: Some(b.rrif),
            tfsa_balance: Some(b.tfsa),
            lira_balance: Some(b.lira),
            corporate_balance: Some(b.corporate),
            nr_cash: Some(b.nonreg_cash),
            nr_gic: Some(b.nonreg_gic),
            nr_invest: Some(b.nonreg_invest),
            nonreg_acb: Some(b.nonreg_acb),
            tfsa_room_annual: person.tfsa_room_annual,
            employer_pension_annual: Some(person.employer_pension_annual),
            pension_start_age: Some(person.pension_start_age),
            other_income_annual: Some(person.other_income_annual),
            prior_year_income: person.prior_year_income,
            prior_year_sources: (!person.prior_year_sources.is_empty())
                .then(|| person.prior_year_sources.clone()),
            cpp_history: Some(person.cpp_history.clone()),
            y_rrsp_growth: Some(r.rrsp),
            y_rrif_growth: Some(r.rrif),
            y_tfsa_growth: Some(r.tfsa),
            y_lira_growth: Some(r.lira),
            y_corp_growth: Some(r.corporate),
            y_nr_cash_interest: Some(r.nonreg_cash),
            y_nr_gic_interest: Some(r.nonreg_gic),
            y_nr_inv_total_return: Some(r.nonreg_invest),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionPayload {
    pub p1: Option<PersonPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p2: Option<PersonPayload>,
    pub province: Option<String>,
    pub start_year: Option<i32>,
    pub end_age: Option<u32>,
    pub marital_status: Option<MaritalStatus>,

    pub spending_go_go: Option<f64>,
    pub go_go_end_age: Option<u32>,
    pub spending_slow_go: Option<f64>,
    pub slow_go_end_age: Option<u32>,
    pub spending_no_go: Option<f64>,
    pub spending_inflation: Option<f64>,
    pub general_inflation: Option<f64>,

    pub strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub withdrawal_order: Option<Vec<String>>,
    pub income_split_fraction: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_tier: Option<ReturnTier>,
}

fn province_code(province: Province) -> &'static str {
    match province {
        Province::Ontario => "ON",
        Province::BritishColumbia => "BC",
        Province::Alberta => "AB",
        Province::Quebec => "QC",
    }
}

impl ProjectionPayload {
    pub fn into_domain(self) -> EngineResult<(Household, Strategy)> {
        let p1 = self
            .p1
            .ok_or_else(|| EngineError::invalid("p1", "primary person is required"))?;
        let mut people = vec![p1.into_person("p1")?];
        if let Some(p2) = self.p2 {
            people.push(p2.into_person("p2")?);
        }

        let province = match self.province.as_deref() {
            Some(code) => code.parse::<Province>()?,
            None => Province::Ontario,
        };
        let marital_status = self.marital_status.unwrap_or(if people.len() > 1 {
            MaritalStatus::Married
        } else {
            MaritalStatus::Single
        });

        let spending = SpendingSchedule::go_go_slow_go_no_go(
            self.spending_go_go.unwrap_or(DEFAULT_GO_GO),
            self.go_go_end_age.unwrap_or(DEFAULT_GO_GO_END),
            self.spending_slow_go.unwrap_or(DEFAULT_SLOW_GO),
            self.slow_go_end_age.unwrap_or(DEFAULT_SLOW_GO_END),
            self.spending_no_go.unwrap_or(DEFAULT_NO_GO),
            self.spending_inflation.unwrap_or(DEFAULT_INFLATION),
        );
        let name = self.strategy.unwrap_or_else(|| DEFAULT_STRATEGY.to_string());
        let mut strategy = Strategy::named(&name, spending)?;
        if let Some(order) = self.withdrawal_order {
            strategy.withdrawal_order = order
                .iter()
                .map(|s| s.parse::<AccountKind>())
                .collect::<EngineResult<Vec<_>>>()?;
        }
        strategy.income_split_fraction = self.income_split_fraction.unwrap_or(0.0);

        let household = Household {
            people,
            province,
            marital_status,
            start_year: self.start_year.unwrap_or(DEFAULT_START_YEAR),
            end_age: self.end_age.unwrap_or(DEFAULT_END_AGE),
            general_inflation: self.general_inflation.unwrap_or(DEFAULT_INFLATION),
        };
        Ok((household, strategy))
    }

    pub fn from_domain(household: &Household, strategy: &Strategy) -> Self {
        let phases = &strategy.spending.phases;
        let phase = |i: usize| -> Option<SpendingPhase> {
            phases.get(i).or(phases.last()).copied()
        };
        let go_go = phase(0);
        let slow_go = phase(1);
        let no_go = phase(2);

        Self {
            p1: household.people.first().map(PersonPayload::from_person),
            p2: household.people.get(1).map(PersonPayload::from_person),
            province: Some(province_code(household.province).to_string()),
            start_year: Some(household.start_year),
            end_age: Some(household.end_age),
            marital_status: Some(household.marital_status),
            spending_go_go: go_go.map(|p| p.annual_amount),
            go_go_end_age: go_go.and_then(|p| p.end_age),
            spending_slow_go: slow_go.map(|p| p.annual_amount),
            slow_go_end_age: slow_go.and_then(|p| p.end_age),
            spending_no_go: no_go.map(|p| p.annual_amount),
            spending_inflation: Some(strategy.spending.inflation),
            general_inflation: Some(household.general_inflation),
            strategy: Some(strategy.name.clone()),
            withdrawal_order: Some(
                strategy
                    .withdrawal_order
                    .iter()
                    .map(|k| k.as_str().to_string())
                    .collect(),
            ),
            income_split_fraction: Some(strategy.income_split_fraction),
            return_tier: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryResponse {
    pub years_funded: u32,
    pub years_total: u32,
    pub health_score: u32,
    pub final_estate: f64,
    pub final_estate_real: f64,
    pub avg_effective_tax_rate: f64,
    pub total_tax_paid: f64,
    pub total_income: f64,
    pub total_benefits: f64,
    pub assets_depleted: bool,
    pub depletion_age: Option<u32>,
    pub success: bool,
    pub fault: Option<NumericFault>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionResponse {
    pub summary: SummaryResponse,
    pub year_by_year: Vec<ProjectionYear>,
}

impl From<ProjectionSummary> for ProjectionResponse {
    fn from(s: ProjectionSummary) -> Self {
        Self {
            summary: SummaryResponse {
                years_funded: s.years_funded,
                years_total: s.years_simulated,
                health_score: s.health_score,
                final_estate: s.final_estate,
                final_estate_real: s.final_estate_real,
                avg_effective_tax_rate: s.avg_effective_tax_rate,
                total_tax_paid: s.total_tax,
                total_income: s.total_income,
                total_benefits: s.total_benefits,
                assets_depleted: s.assets_depleted,
                depletion_age: s.depletion_age,
                success: s.success,
                fault: s.fault,
            },
            year_by_year: s.years,
        }
    }
}
