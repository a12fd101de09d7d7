use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{EngineError, EngineResult};
use super::gis::IncomeItem;

pub const CPP_MIN_START_AGE: u32 = 60;
pub const CPP_MAX_START_AGE: u32 = 70;
pub const OAS_MIN_START_AGE: u32 = 65;
pub const OAS_MAX_START_AGE: u32 = 70;
pub const MAX_PROJECTION_YEARS: u32 = 60;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    Rrsp,
    Rrif,
    Tfsa,
    #[serde(alias = "lif")]
    Lira,
    #[serde(alias = "nonreg", alias = "non-registered")]
    NonRegistered,
    #[serde(alias = "corp")]
    Corporate,
}

impl AccountKind {
    pub const ALL: [AccountKind; 6] = [
        AccountKind::Rrsp,
        AccountKind::Rrif,
        AccountKind::Tfsa,
        AccountKind::Lira,
        AccountKind::NonRegistered,
        AccountKind::Corporate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AccountKind::Rrsp => "rrsp",
            AccountKind::Rrif => "rrif",
            AccountKind::Tfsa => "tfsa",
            AccountKind::Lira => "lira",
            AccountKind::NonRegistered => "non_registered",
            AccountKind::Corporate => "corporate",
        }
    }

    pub fn fully_taxable(self) -> bool {
        matches!(
            self,
            AccountKind::Rrsp | AccountKind::Rrif | AccountKind::Lira | AccountKind::Corporate
        )
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "rrsp" => Ok(AccountKind::Rrsp),
            "rrif" => Ok(AccountKind::Rrif),
            "tfsa" => Ok(AccountKind::Tfsa),
            "lira" | "lif" => Ok(AccountKind::Lira),
            "non_registered" | "nonreg" | "nr" => Ok(AccountKind::NonRegistered),
            "corporate" | "corp" => Ok(AccountKind::Corporate),
            _ => Err(EngineError::UnknownAccount(s.to_string())),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Province {
    #[serde(rename = "ON", alias = "on", alias = "ontario")]
    Ontario,
    #[serde(rename = "BC", alias = "bc", alias = "british_columbia")]
    BritishColumbia,
    #[serde(rename = "AB", alias = "ab", alias = "alberta")]
    Alberta,
    #[serde(rename = "QC", alias = "qc", alias = "quebec")]
    Quebec,
}

impl FromStr for Province {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ON" | "ONTARIO" => Ok(Province::Ontario),
            "BC" | "BRITISH_COLUMBIA" | "BRITISH COLUMBIA" => Ok(Province::BritishColumbia),
            "AB" | "ALBERTA" => Ok(Province::Alberta),
            "QC" | "QUEBEC" => Ok(Province::Quebec),
            _ => Err(EngineError::UnknownProvince(s.to_string())),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaritalStatus {
    #[default]
    Single,
    Married,
    #[serde(alias = "common-law")]
    CommonLaw,
    Widowed,
    Divorced,
    Separated,
}

impl MaritalStatus {
    pub fn is_couple(self) -> bool {
        matches!(self, MaritalStatus::Married | MaritalStatus::CommonLaw)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContributionRecord {
    pub year: i32,
    pub pensionable_earnings: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CppHistory {
    Records(Vec<ContributionRecord>),
    Summary {
        average_indexed_earnings: f64,
        contributory_years: f64,
    },
}

impl Default for CppHistory {
    fn default() -> Self {
        CppHistory::Records(Vec::new())
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountBalances {
    pub rrsp: f64,
    pub rrif: f64,
    pub tfsa: f64,
    pub lira: f64,
    pub nonreg_cash: f64,
    pub nonreg_gic: f64,
    pub nonreg_invest: f64,
    pub nonreg_acb: f64,
    pub corporate: f64,
}

impl AccountBalances {
    pub fn nonreg_total(&self) -> f64 {
        self.nonreg_cash + self.nonreg_gic + self.nonreg_invest
    }

    pub fn get(&self, kind: AccountKind) -> f64 {
        match kind {
            AccountKind::Rrsp => self.rrsp,
            AccountKind::Rrif => self.rrif,
            AccountKind::Tfsa => self.tfsa,
            AccountKind::Lira => self.lira,
            AccountKind::NonRegistered => self.nonreg_total(),
            AccountKind::Corporate => self.corporate,
        }
    }

    pub fn total(&self) -> f64 {
        AccountKind::ALL.iter().map(|&k| self.get(k)).sum()
    }

    pub fn to_amounts(&self) -> AccountAmounts {
        AccountAmounts {
            rrsp: self.rrsp,
            rrif: self.rrif,
            tfsa: self.tfsa,
            lira: self.lira,
            non_registered: self.nonreg_total(),
            corporate: self.corporate,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountReturns {
    pub rrsp: f64,
    pub rrif: f64,
    pub tfsa: f64,
    pub lira: f64,
    pub corporate: f64,
    pub nonreg_cash: f64,
    pub nonreg_gic: f64,
    pub nonreg_invest: f64,
}

const MIN_SHIFTED_RATE: f64 = -0.99;

impl Default for AccountReturns {
    fn default() -> Self {
        Self {
            rrsp: 0.05,
            rrif: 0.05,
            tfsa: 0.05,
            lira: 0.05,
            corporate: 0.045,
            nonreg_cash: 0.02,
            nonreg_gic: 0.035,
            nonreg_invest: 0.05,
        }
    }
}

impl AccountReturns {
    // Never pushes a rate below MIN_SHIFTED_RATE, or below where it started.
    pub fn shifted(&self, delta: f64) -> Self {
        let s = |r: f64| (r + delta).max(r.min(MIN_SHIFTED_RATE));
        Self {
            rrsp: s(self.rrsp),
            rrif: s(self.rrif),
            tfsa: s(self.tfsa),
            lira: s(self.lira),
            corporate: s(self.corporate),
            nonreg_cash: s(self.nonreg_cash),
            nonreg_gic: s(self.nonreg_gic),
            nonreg_invest: s(self.nonreg_invest),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClaimingAges {
    pub cpp_start_age: u32,
    pub oas_start_age: u32,
}

impl Default for ClaimingAges {
    fn default() -> Self {
        Self {
            cpp_start_age: 65,
            oas_start_age: 65,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub name: String,
    pub current_age: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birth_year: Option<i32>,
    #[serde(default)]
    pub cpp_history: CppHistory,
    pub years_in_canada: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpp_annual_at_start: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oas_annual_at_start: Option<f64>,
    #[serde(default)]
    pub claiming: ClaimingAges,
    #[serde(default)]
    pub balances: AccountBalances,
    #[serde(default)]
    pub returns: AccountReturns,
    #[serde(default)]
    pub employer_pension_annual: f64,
    #[serde(default)]
    pub pension_start_age: u32,
    #[serde(default)]
    pub other_income_annual: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tfsa_room_annual: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_year_income: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prior_year_sources: Vec<IncomeItem>,
}

impl Person {
    pub fn new(name: &str, current_age: u32) -> Self {
        Self {
            name: name.to_string(),
            current_age,
            birth_year: None,
            cpp_history: CppHistory::default(),
            years_in_canada: 40,
            cpp_annual_at_start: None,
            oas_annual_at_start: None,
            claiming: ClaimingAges::default(),
            balances: AccountBalances::default(),
            returns: AccountReturns::default(),
            employer_pension_annual: 0.0,
            pension_start_age: 0,
            other_income_annual: 0.0,
            tfsa_room_annual: None,
            prior_year_income: None,
            prior_year_sources: Vec::new(),
        }
    }

    pub fn age_in(&self, calendar_year: i32, start_year: i32) -> u32 {
        match self.birth_year {
            Some(born) => (calendar_year - born).max(0) as u32,
            None => self.current_age + (calendar_year - start_year).max(0) as u32,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpendingPhase {
    pub annual_amount: f64,
    // inclusive
    pub end_age: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpendingSchedule {
    pub phases: Vec<SpendingPhase>,
    pub inflation: f64,
}

impl SpendingSchedule {
    pub fn go_go_slow_go_no_go(
        go_go: f64,
        go_go_end_age: u32,
        slow_go: f64,
        slow_go_end_age: u32,
        no_go: f64,
        inflation: f64,
    ) -> Self {
        Self {
            phases: vec![
                SpendingPhase {
                    annual_amount: go_go,
                    end_age: Some(go_go_end_age),
                },
                SpendingPhase {
                    annual_amount: slow_go,
                    end_age: Some(slow_go_end_age),
                },
                SpendingPhase {
                    annual_amount: no_go,
                    end_age: None,
                },
            ],
            inflation,
        }
    }

    pub fn flat(annual_amount: f64, inflation: f64) -> Self {
        Self {
            phases: vec![SpendingPhase {
                annual_amount,
                end_age: None,
            }],
            inflation,
        }
    }

    pub fn target_for_age(&self, age: u32) -> f64 {
        self.phases
            .iter()
            .find(|p| p.end_age.is_none_or(|end| age <= end))
            .or(self.phases.last())
            .map(|p| p.annual_amount)
            .unwrap_or(0.0)
    }
}

pub fn preset_withdrawal_order(name: &str) -> Option<Vec<AccountKind>> {
    use AccountKind::*;
    let order = match name.trim().to_ascii_lowercase().replace('_', "-").as_str() {
        "balanced" => vec![NonRegistered, Rrif, Rrsp, Lira, Corporate, Tfsa],
        "rrif-frontload" | "rrsp-first" => vec![Rrif, Rrsp, Lira, NonRegistered, Corporate, Tfsa],
        "minimize-income" | "tfsa-first" => vec![Tfsa, NonRegistered, Corporate, Rrif, Rrsp, Lira],
        "capital-gains-optimized" | "nonreg-first" => {
            vec![NonRegistered, Corporate, Rrif, Rrsp, Lira, Tfsa]
        }
        "corporate-optimized" | "corporate-first" => {
            vec![Corporate, Rrif, Rrsp, Lira, NonRegistered, Tfsa]
        }
        _ => return None,
    };
    Some(order)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub name: String,
    pub withdrawal_order: Vec<AccountKind>,
    pub spending: SpendingSchedule,
    #[serde(default)]
    pub claiming_overrides: Vec<Option<ClaimingAges>>,
    #[serde(default)]
    pub income_split_fraction: f64,
}

impl Strategy {
    pub fn named(name: &str, spending: SpendingSchedule) -> EngineResult<Self> {
        let withdrawal_order = preset_withdrawal_order(name)
            .ok_or_else(|| EngineError::invalid("strategy", format!("unknown strategy '{name}'")))?;
        Ok(Self {
            name: name.to_string(),
            withdrawal_order,
            spending,
            claiming_overrides: Vec::new(),
            income_split_fraction: 0.0,
        })
    }

    pub fn effective_order(&self) -> Vec<AccountKind> {
        let mut order = self.withdrawal_order.clone();
        for kind in preset_withdrawal_order("balanced").unwrap_or_default() {
            if !order.contains(&kind) {
                order.push(kind);
            }
        }
        order
    }

    pub fn claiming_for(&self, index: usize, person: &Person) -> ClaimingAges {
        self.claiming_overrides
            .get(index)
            .copied()
            .flatten()
            .unwrap_or(person.claiming)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Household {
    pub people: Vec<Person>,
    pub province: Province,
    #[serde(default)]
    pub marital_status: MaritalStatus,
    pub start_year: i32,
    pub end_age: u32,
    pub general_inflation: f64,
}

impl Household {
    pub fn primary(&self) -> Option<&Person> {
        self.people.first()
    }

    pub fn is_couple(&self) -> bool {
        self.people.len() > 1 || self.marital_status.is_couple()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenefitEstimate {
    pub monthly_amount: f64,
    pub annual_amount: f64,
    pub gross_annual_amount: f64,
    pub adjustment_factor: f64,
    pub clawback_amount: f64,
    pub eligible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BenefitEstimate {
    pub fn ineligible(reason: impl Into<String>) -> Self {
        Self {
            monthly_amount: 0.0,
            annual_amount: 0.0,
            gross_annual_amount: 0.0,
            adjustment_factor: 0.0,
            clawback_amount: 0.0,
            eligible: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Eligibility {
    pub eligible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Eligibility {
    pub fn eligible() -> Self {
        Self {
            eligible: true,
            reason: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            eligible: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountAmounts {
    pub rrsp: f64,
    pub rrif: f64,
    pub tfsa: f64,
    pub lira: f64,
    pub non_registered: f64,
    pub corporate: f64,
}

impl AccountAmounts {
    pub fn get(&self, kind: AccountKind) -> f64 {
        match kind {
            AccountKind::Rrsp => self.rrsp,
            AccountKind::Rrif => self.rrif,
            AccountKind::Tfsa => self.tfsa,
            AccountKind::Lira => self.lira,
            AccountKind::NonRegistered => self.non_registered,
            AccountKind::Corporate => self.corporate,
        }
    }

    pub fn add(&mut self, kind: AccountKind, amount: f64) {
        match kind {
            AccountKind::Rrsp => self.rrsp += amount,
            AccountKind::Rrif => self.rrif += amount,
            AccountKind::Tfsa => self.tfsa += amount,
            AccountKind::Lira => self.lira += amount,
            AccountKind::NonRegistered => self.non_registered += amount,
            AccountKind::Corporate => self.corporate += amount,
        }
    }

    pub fn accumulate(&mut self, other: &AccountAmounts) {
        for kind in AccountKind::ALL {
            self.add(kind, other.get(kind));
        }
    }

    pub fn total(&self) -> f64 {
        AccountKind::ALL.iter().map(|&k| self.get(k)).sum()
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IncomeBySource {
    pub cpp: f64,
    pub oas: f64,
    pub gis: f64,
    pub employer_pension: f64,
    pub other: f64,
    pub nonreg_interest: f64,
}

impl IncomeBySource {
    pub fn total(&self) -> f64 {
        self.cpp + self.oas + self.gis + self.employer_pension + self.other + self.nonreg_interest
    }

    pub fn government_benefits(&self) -> f64 {
        self.cpp + self.oas + self.gis
    }

    pub fn accumulate(&mut self, other: &IncomeBySource) {
        self.cpp += other.cpp;
        self.oas += other.oas;
        self.gis += other.gis;
        self.employer_pension += other.employer_pension;
        self.other += other.other;
        self.nonreg_interest += other.nonreg_interest;
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersonYear {
    pub name: String,
    pub age: u32,
    pub income: IncomeBySource,
    pub oas_gross: f64,
    pub withdrawals: AccountAmounts,
    pub realized_capital_gains: f64,
    pub pension_split_out: f64,
    pub pension_split_in: f64,
    pub taxable_income: f64,
    pub income_tax: f64,
    pub oas_clawback: f64,
    pub ending_balances: AccountAmounts,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectionYear {
    pub year: i32,
    pub year_index: u32,
    pub primary_age: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spouse_age: Option<u32>,
    pub spending_need: f64,
    pub spending_funded: f64,
    pub income: IncomeBySource,
    pub withdrawals: AccountAmounts,
    pub taxable_income: f64,
    pub tax_paid: f64,
    pub oas_clawback: f64,
    pub surplus_reinvested: f64,
    pub ending_balances: AccountAmounts,
    pub total_ending_balance: f64,
    pub success: bool,
    pub people: Vec<PersonYear>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NumericFault {
    pub year: i32,
    pub age: u32,
    pub field: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectionSummary {
    pub years: Vec<ProjectionYear>,
    pub total_income: f64,
    pub total_tax: f64,
    pub total_benefits: f64,
    pub final_estate: f64,
    pub final_estate_real: f64,
    pub assets_depleted: bool,
    pub depletion_age: Option<u32>,
    pub success: bool,
    pub years_funded: u32,
    pub years_simulated: u32,
    pub health_score: u32,
    pub avg_effective_tax_rate: f64,
    pub fault: Option<NumericFault>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_kind_parses_aliases_and_rejects_unknown() {
        assert_eq!("NonReg".parse::<AccountKind>(), Ok(AccountKind::NonRegistered));
        assert_eq!("non-registered".parse::<AccountKind>(), Ok(AccountKind::NonRegistered));
        assert_eq!("LIF".parse::<AccountKind>(), Ok(AccountKind::Lira));
        assert_eq!(
            "crypto".parse::<AccountKind>(),
            Err(EngineError::UnknownAccount("crypto".to_string()))
        );
    }

    #[test]
    fn spending_schedule_picks_phase_by_age() {
        let schedule = SpendingSchedule::go_go_slow_go_no_go(80_000.0, 74, 60_000.0, 84, 45_000.0, 0.02);
        assert_eq!(schedule.target_for_age(65), 80_000.0);
        assert_eq!(schedule.target_for_age(74), 80_000.0);
        assert_eq!(schedule.target_for_age(75), 60_000.0);
        assert_eq!(schedule.target_for_age(90), 45_000.0);
    }

    #[test]
    fn effective_order_appends_unnamed_accounts() {
        let mut strategy =
            Strategy::named("balanced", SpendingSchedule::flat(50_000.0, 0.02)).expect("preset");
        strategy.withdrawal_order = vec![AccountKind::Tfsa];
        let order = strategy.effective_order();
        assert_eq!(order.len(), AccountKind::ALL.len());
        assert_eq!(order[0], AccountKind::Tfsa);
        assert_eq!(order[1], AccountKind::NonRegistered);
    }

    #[test]
    fn unknown_strategy_name_is_rejected() {
        let err = Strategy::named("yolo", SpendingSchedule::flat(1.0, 0.0)).expect_err("unknown");
        assert!(matches!(err, EngineError::InputValidation { .. }));
    }

    #[test]
    fn claiming_override_replaces_person_ages() {
        let person = Person::new("A", 60);
        let mut strategy =
            Strategy::named("balanced", SpendingSchedule::flat(1.0, 0.0)).expect("preset");
        assert_eq!(strategy.claiming_for(0, &person), ClaimingAges::default());
        strategy.claiming_overrides = vec![Some(ClaimingAges {
            cpp_start_age: 70,
            oas_start_age: 68,
        })];
        assert_eq!(strategy.claiming_for(0, &person).cpp_start_age, 70);
        assert_eq!(strategy.claiming_for(1, &person), ClaimingAges::default());
    }

    #[test]
    fn birth_year_drives_derived_age() {
        let mut person = Person::new("A", 64);
        assert_eq!(person.age_in(2027, 2025), 66);
        person.birth_year = Some(1960);
        assert_eq!(person.age_in(2027, 2025), 67);
    }
}
