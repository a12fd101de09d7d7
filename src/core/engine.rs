use std::collections::HashSet;

use super::cpp::estimate_cpp_from_history;
use super::error::{EngineError, EngineResult};
use super::gis::{IncomeItem, IncomeSource, calculate_gis, calculate_gis_income};
use super::oas::{gross_annual_oas, oas_clawback};
use super::tables::{BenefitTableSet, BenefitTables, rrif_minimum_factor};
use super::tax::{taxable_capital_gain, total_income_tax};
use super::types::{
    AccountAmounts, AccountBalances, AccountKind, AccountReturns, CPP_MAX_START_AGE,
    CPP_MIN_START_AGE, ClaimingAges, Household, IncomeBySource, MAX_PROJECTION_YEARS,
    NumericFault, OAS_MAX_START_AGE, OAS_MIN_START_AGE, Person, PersonYear, ProjectionSummary,
    ProjectionYear, Province, Strategy,
};

const CONVERSION_AGE: u32 = 72;
const LIF_ACCESS_AGE: u32 = 55;
const SPLIT_ELIGIBLE_AGE: u32 = 65;
const MAX_SPLIT_FRACTION: f64 = 0.5;
const CENT: f64 = 0.01;

pub fn validate(household: &Household, strategy: &Strategy) -> EngineResult<()> {
    let Some(primary) = household.primary() else {
        return Err(EngineError::invalid("people", "at least one person is required"));
    };
    if household.people.len() > 2 {
        return Err(EngineError::invalid(
            "people",
            format!("at most two people are supported, got {}", household.people.len()),
        ));
    }
    if household.people.len() == 2 && !household.marital_status.is_couple() {
        return Err(EngineError::invalid(
            "marital_status",
            "a two-person household must be married or common-law",
        ));
    }
    for person in &household.people {
        check_birth_year(person, household.start_year)?;
    }
    let start_age = primary.age_in(household.start_year, household.start_year);
    if household.end_age < start_age {
        return Err(EngineError::invalid(
            "end_age",
            format!(
                "must be at least the primary's current age {start_age}, got {}",
                household.end_age
            ),
        ));
    }
    let years = household.end_age - start_age + 1;
    if years > MAX_PROJECTION_YEARS {
        return Err(EngineError::invalid(
            "end_age",
            format!("projection would run {years} years, the limit is {MAX_PROJECTION_YEARS}"),
        ));
    }
    check_rate("general_inflation", household.general_inflation)?;
    check_rate("spending_inflation", strategy.spending.inflation)?;

    for (index, person) in household.people.iter().enumerate() {
        validate_person(person, strategy.claiming_for(index, person))?;
    }

    if strategy.spending.phases.is_empty() {
        return Err(EngineError::invalid("spending", "at least one spending phase is required"));
    }
    for phase in &strategy.spending.phases {
        check_amount("spending", phase.annual_amount)?;
    }
    if !(0.0..=MAX_SPLIT_FRACTION).contains(&strategy.income_split_fraction) {
        return Err(EngineError::invalid(
            "income_split_fraction",
            format!(
                "must be between 0 and {MAX_SPLIT_FRACTION}, got {}",
                strategy.income_split_fraction
            ),
        ));
    }

    let mut seen = HashSet::new();
    for kind in &strategy.withdrawal_order {
        if !seen.insert(*kind) {
            return Err(EngineError::invalid(
                "withdrawal_order",
                format!("{kind} appears more than once"),
            ));
        }
    }
    Ok(())
}

fn validate_person(person: &Person, claiming: ClaimingAges) -> EngineResult<()> {
    if !(CPP_MIN_START_AGE..=CPP_MAX_START_AGE).contains(&claiming.cpp_start_age) {
        return Err(EngineError::invalid(
            "cpp_start_age",
            format!(
                "{}: must be between {CPP_MIN_START_AGE} and {CPP_MAX_START_AGE}, got {}",
                person.name, claiming.cpp_start_age
            ),
        ));
    }
    if !(OAS_MIN_START_AGE..=OAS_MAX_START_AGE).contains(&claiming.oas_start_age) {
        return Err(EngineError::invalid(
            "oas_start_age",
            format!(
                "{}: must be between {OAS_MIN_START_AGE} and {OAS_MAX_START_AGE}, got {}",
                person.name, claiming.oas_start_age
            ),
        ));
    }

    let b = &person.balances;
    for (field, value) in [
        ("rrsp_balance", b.rrsp),
        ("rrif_balance", b.rrif),
        ("tfsa_balance", b.tfsa),
        ("lira_balance", b.lira),
        ("corporate_balance", b.corporate),
        ("nr_cash", b.nonreg_cash),
        ("nr_gic", b.nonreg_gic),
        ("nr_invest", b.nonreg_invest),
        ("nonreg_acb", b.nonreg_acb),
        ("employer_pension_annual", person.employer_pension_annual),
        ("other_income_annual", person.other_income_annual),
    ] {
        check_amount(field, value)?;
    }
    if b.nonreg_acb > b.nonreg_invest + CENT {
        return Err(EngineError::invalid(
            "nonreg_acb",
            format!("{}: cannot exceed the invest bucket", person.name),
        ));
    }
    for (field, value) in [
        ("cpp_annual_at_start", person.cpp_annual_at_start),
        ("oas_annual_at_start", person.oas_annual_at_start),
        ("tfsa_room_annual", person.tfsa_room_annual),
        ("prior_year_income", person.prior_year_income),
    ] {
        if let Some(value) = value {
            check_amount(field, value)?;
        }
    }
    for item in &person.prior_year_sources {
        check_amount("prior_year_sources", item.amount)?;
    }

    let r = &person.returns;
    for (field, value) in [
        ("y_rrsp_growth", r.rrsp),
        ("y_rrif_growth", r.rrif),
        ("y_tfsa_growth", r.tfsa),
        ("y_lira_growth", r.lira),
        ("y_corp_growth", r.corporate),
        ("y_nr_cash_interest", r.nonreg_cash),
        ("y_nr_gic_interest", r.nonreg_gic),
        ("y_nr_inv_total_return", r.nonreg_invest),
    ] {
        check_rate(field, value)?;
    }
    Ok(())
}

// A birthday still ahead in the start year leaves current_age one below.
fn check_birth_year(person: &Person, start_year: i32) -> EngineResult<()> {
    let Some(born) = person.birth_year else {
        return Ok(());
    };
    let implied = i64::from(start_year) - i64::from(born);
    if implied < 0 || (implied - i64::from(person.current_age)).abs() > 1 {
        return Err(EngineError::invalid(
            "birth_year",
            format!(
                "{}: born {born} is {implied} in {start_year}, which contradicts current age {}",
                person.name, person.current_age
            ),
        ));
    }
    Ok(())
}

fn check_amount(field: &str, value: f64) -> EngineResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(EngineError::invalid(
            field,
            format!("must be a finite non-negative amount, got {value}"),
        ));
    }
    Ok(())
}

fn check_rate(field: &str, value: f64) -> EngineResult<()> {
    if !value.is_finite() || value <= -1.0 {
        return Err(EngineError::invalid(
            field,
            format!("must be a finite rate above -100%, got {value}"),
        ));
    }
    Ok(())
}

fn tables_for_year(
    tables: &BenefitTableSet,
    year: i32,
    general_inflation: f64,
) -> EngineResult<BenefitTables> {
    let base = tables.for_year(year)?;
    let gap = year - base.year;
    Ok(base.indexed((1.0 + general_inflation).powi(gap)))
}

#[derive(Clone, Debug, Default)]
struct PriorYearIncome {
    net_income: f64,
    gis_items: Vec<IncomeItem>,
}

struct PersonState<'a> {
    person: &'a Person,
    claiming: ClaimingAges,
    balances: AccountBalances,
    cpp_annual_today: f64,
    oas_residency_years: u32,
    prior: Option<PriorYearIncome>,
}

impl<'a> PersonState<'a> {
    fn new(
        person: &'a Person,
        claiming: ClaimingAges,
        start_tables: &BenefitTables,
    ) -> EngineResult<Self> {
        let cpp_annual_today = match person.cpp_annual_at_start {
            Some(amount) => amount,
            None => {
                estimate_cpp_from_history(
                    &person.cpp_history,
                    claiming.cpp_start_age,
                    person.current_age,
                    start_tables,
                )?
                .annual_amount
            }
        };
        let years_until_oas = claiming.oas_start_age.saturating_sub(person.current_age);
        let oas_residency_years =
            (person.years_in_canada + years_until_oas).min(start_tables.oas.full_residency_years);
        let mut balances = person.balances;
        balances.nonreg_acb = balances.nonreg_acb.min(balances.nonreg_invest);

        Ok(Self {
            person,
            claiming,
            balances,
            cpp_annual_today,
            oas_residency_years,
            prior: caller_prior_year(person),
        })
    }

}

// An itemised prior year keeps the GIS exemptions; a bare total counts in full.
fn caller_prior_year(person: &Person) -> Option<PriorYearIncome> {
    if person.prior_year_sources.is_empty() {
        return person.prior_year_income.map(|income| PriorYearIncome {
            net_income: income,
            gis_items: vec![IncomeItem {
                source: IncomeSource::Other,
                amount: income,
            }],
        });
    }
    let itemised: f64 = person.prior_year_sources.iter().map(|item| item.amount).sum();
    Some(PriorYearIncome {
        net_income: person.prior_year_income.unwrap_or(itemised),
        gis_items: person.prior_year_sources.clone(),
    })
}

#[derive(Clone, Debug, Default)]
struct PersonFlows {
    age: u32,
    income: IncomeBySource,
    oas_gross: f64,
    clawback: f64,
    withdrawals: AccountAmounts,
    realized_gain: f64,
    taxable_own: f64,
    split_out: f64,
    split_in: f64,
    split_eligible: f64,
}

impl PersonFlows {
    fn taxable_income(&self) -> f64 {
        (self.taxable_own - self.split_out + self.split_in).max(0.0)
    }

    fn cash_received(&self) -> f64 {
        self.income.cpp
            + self.oas_gross
            + self.income.gis
            + self.income.employer_pension
            + self.income.other
            + self.withdrawals.total()
    }

    fn gis_items(&self) -> Vec<IncomeItem> {
        let w = &self.withdrawals;
        [
            (IncomeSource::Cpp, self.income.cpp),
            (IncomeSource::EmployerPension, self.income.employer_pension),
            (IncomeSource::Other, self.income.other),
            (IncomeSource::Interest, self.income.nonreg_interest),
            (IncomeSource::Rrsp, w.rrsp),
            (IncomeSource::Rrif, w.rrif),
            (IncomeSource::Lira, w.lira),
            (IncomeSource::Corporate, w.corporate),
            (IncomeSource::CapitalGains, self.realized_gain.max(0.0)),
        ]
        .into_iter()
        .filter(|&(_, amount)| amount > 0.0)
        .map(|(source, amount)| IncomeItem { source, amount })
        .collect()
    }
}

struct YearContext {
    tables: BenefitTables,
    province: Province,
}

impl YearContext {
    fn tax_on(&self, taxable_income: f64) -> f64 {
        total_income_tax(taxable_income, self.province, &self.tables)
    }
}

pub fn run_projection(
    household: &Household,
    strategy: &Strategy,
    tables: &BenefitTableSet,
) -> EngineResult<ProjectionSummary> {
    validate(household, strategy)?;
    let order = strategy.effective_order();
    let g = household.general_inflation;
    let start_tables = tables_for_year(tables, household.start_year, g)?;

    let mut states = household
        .people
        .iter()
        .enumerate()
        .map(|(index, person)| {
            PersonState::new(person, strategy.claiming_for(index, person), &start_tables)
        })
        .collect::<EngineResult<Vec<_>>>()?;

    let primary_start_age = states[0].person.age_in(household.start_year, household.start_year);
    let year_count = household.end_age - primary_start_age + 1;
    tracing::info!(
        people = states.len(),
        years = year_count,
        strategy = %strategy.name,
        "starting projection"
    );

    let mut years = Vec::with_capacity(year_count as usize);
    let mut depletion_age = None;
    let mut fault = None;

    for year_index in 0..year_count {
        let year = household.start_year + year_index as i32;
        let general_index = (1.0 + g).powi(year_index as i32);
        let ctx = YearContext {
            tables: tables_for_year(tables, year, g)?,
            province: household.province,
        };
        let primary_age = states[0].person.age_in(year, household.start_year);

        let spending_need = strategy.spending.target_for_age(primary_age)
            * (1.0 + strategy.spending.inflation).powi(year_index as i32);

        let mut flows: Vec<PersonFlows> = states
            .iter_mut()
            .map(|state| {
                let age = state.person.age_in(year, household.start_year);
                convert_accounts(&mut state.balances, age);
                let mut f = guaranteed_income(state, age, general_index, &ctx.tables);
                take_minimums(state, &mut f);
                f
            })
            .collect();

        apply_clawback_and_gis(household, &states, &mut flows, &ctx.tables)?;
        split_pension_income(&mut flows, strategy.income_split_fraction);

        let guaranteed_net: f64 = flows
            .iter()
            .map(|f| f.cash_received() - ctx.tax_on(f.taxable_income()) - f.clawback)
            .sum();
        let mut remaining = spending_need - guaranteed_net;

        if remaining > 0.0 {
            for &kind in &order {
                for (state, f) in states.iter_mut().zip(flows.iter_mut()) {
                    if remaining <= 0.0 {
                        break;
                    }
                    remaining -= withdraw_for_net(kind, remaining, state, f, &ctx);
                }
            }
        }

        let unmet = remaining.max(0.0);
        let success = unmet <= CENT;
        if !success {
            tracing::warn!(year, age = primary_age, unmet, "spending only partially funded");
            let remaining_assets: f64 = states.iter().map(|s| s.balances.total()).sum();
            if depletion_age.is_none() && remaining_assets <= CENT {
                tracing::warn!(year, age = primary_age, "household assets depleted");
                depletion_age = Some(primary_age);
            }
        }

        let surplus = (-remaining).max(0.0);
        let surplus_reinvested = reinvest_surplus(surplus, &mut states, general_index, &ctx.tables);

        let mut people = Vec::with_capacity(states.len());
        for (state, f) in states.iter_mut().zip(&flows) {
            let taxable_income = f.taxable_income();
            let income_tax = ctx.tax_on(taxable_income);
            state.prior = Some(PriorYearIncome {
                net_income: taxable_income,
                gis_items: f.gis_items(),
            });
            apply_growth(&mut state.balances, &state.person.returns);
            people.push(PersonYear {
                name: state.person.name.clone(),
                age: f.age,
                income: f.income,
                oas_gross: f.oas_gross,
                withdrawals: f.withdrawals,
                realized_capital_gains: f.realized_gain,
                pension_split_out: f.split_out,
                pension_split_in: f.split_in,
                taxable_income,
                income_tax,
                oas_clawback: f.clawback,
                ending_balances: state.balances.to_amounts(),
            });
        }

        let record = build_year(
            year,
            year_index,
            primary_age,
            spending_need,
            spending_need - unmet,
            surplus_reinvested,
            success,
            people,
        );

        if let Some(field) = first_non_finite(&record) {
            tracing::error!(year, age = primary_age, field, "non-finite value, aborting projection");
            fault = Some(NumericFault {
                year,
                age: primary_age,
                field: field.to_string(),
            });
            break;
        }
        tracing::debug!(
            year,
            age = primary_age,
            need = spending_need,
            tax = record.tax_paid,
            balance = record.total_ending_balance,
            "projected year"
        );
        years.push(record);
    }

    let summary = summarize(years, depletion_age, fault, g);
    tracing::info!(
        success = summary.success,
        years_funded = summary.years_funded,
        final_estate = summary.final_estate,
        "projection finished"
    );
    Ok(summary)
}

fn convert_accounts(balances: &mut AccountBalances, age: u32) {
    if age >= CONVERSION_AGE && balances.rrsp > 0.0 {
        balances.rrif += balances.rrsp;
        balances.rrsp = 0.0;
    }
}

fn guaranteed_income(
    state: &PersonState,
    age: u32,
    general_index: f64,
    tables: &BenefitTables,
) -> PersonFlows {
    let person = state.person;
    let balances = &state.balances;
    let mut income = IncomeBySource::default();

    if age >= state.claiming.cpp_start_age {
        income.cpp = state.cpp_annual_today * general_index;
    }
    let oas_gross = match person.oas_annual_at_start {
        Some(amount) if age >= state.claiming.oas_start_age => {
            let bonus = if age >= 75 { 1.0 + tables.oas.age_75_bonus } else { 1.0 };
            amount * general_index * bonus
        }
        Some(_) => 0.0,
        None => gross_annual_oas(
            state.oas_residency_years,
            state.claiming.oas_start_age,
            age,
            &tables.oas,
        ),
    };
    if age >= person.pension_start_age {
        income.employer_pension = person.employer_pension_annual * general_index;
    }
    income.other = person.other_income_annual * general_index;
    income.nonreg_interest = balances.nonreg_cash * person.returns.nonreg_cash.max(0.0)
        + balances.nonreg_gic * person.returns.nonreg_gic.max(0.0);

    let taxable_own = income.cpp
        + oas_gross
        + income.employer_pension
        + income.other
        + income.nonreg_interest;

    PersonFlows {
        age,
        income,
        oas_gross,
        taxable_own,
        split_eligible: income.employer_pension,
        ..PersonFlows::default()
    }
}

fn take_minimums(state: &mut PersonState, flows: &mut PersonFlows) {
    let age = flows.age;
    let factor = rrif_minimum_factor(age);
    let rrif_min = state.balances.rrif * factor;
    let lif_min = if age >= CONVERSION_AGE {
        state.balances.lira * factor
    } else {
        0.0
    };

    state.balances.rrif -= rrif_min;
    state.balances.lira -= lif_min;
    flows.withdrawals.rrif += rrif_min;
    flows.withdrawals.lira += lif_min;
    flows.taxable_own += rrif_min + lif_min;
    if age >= SPLIT_ELIGIBLE_AGE {
        flows.split_eligible += rrif_min + lif_min;
    }
}

// Recovery tax and GIS use the previous year's income.
fn apply_clawback_and_gis(
    household: &Household,
    states: &[PersonState],
    flows: &mut [PersonFlows],
    tables: &BenefitTables,
) -> EngineResult<()> {
    let priors: Vec<PriorYearIncome> = states
        .iter()
        .zip(flows.iter())
        .map(|(state, f)| {
            state.prior.clone().unwrap_or_else(|| PriorYearIncome {
                net_income: f.taxable_own,
                gis_items: f.gis_items(),
            })
        })
        .collect();

    let mut countable = Vec::with_capacity(priors.len());
    for prior in &priors {
        countable.push(calculate_gis_income(&prior.gis_items, tables)?.total_gis_income);
    }
    let household_countable: f64 = countable.iter().sum();

    for i in 0..flows.len() {
        let clawback = oas_clawback(flows[i].oas_gross, priors[i].net_income, &tables.oas);
        flows[i].clawback = clawback;
        flows[i].income.oas = flows[i].oas_gross - clawback;

        if flows[i].age < OAS_MIN_START_AGE || flows[i].oas_gross <= 0.0 {
            continue;
        }
        let spouse_receives_oas = flows
            .iter()
            .enumerate()
            .any(|(j, f)| j != i && f.oas_gross > 0.0);
        let category_income = if household.marital_status.is_couple() {
            household_countable
        } else {
            countable[i]
        };
        let gis = calculate_gis(
            category_income,
            household.marital_status,
            spouse_receives_oas,
            tables,
        )?;
        flows[i].income.gis = gis.annual_amount;
    }
    Ok(())
}

fn split_pension_income(flows: &mut [PersonFlows], fraction: f64) {
    if flows.len() != 2 || fraction <= 0.0 {
        return;
    }
    let (high, low) = if flows[0].taxable_own >= flows[1].taxable_own {
        (0, 1)
    } else {
        (1, 0)
    };
    let gap = (flows[high].taxable_own - flows[low].taxable_own).max(0.0);
    let transfer = (flows[high].split_eligible * fraction).min(gap / 2.0);
    if transfer <= 0.0 {
        return;
    }
    flows[high].split_out = transfer;
    flows[low].split_in = transfer;
}

// Returns the net raised.
fn withdraw_for_net(
    kind: AccountKind,
    target_net: f64,
    state: &mut PersonState,
    flows: &mut PersonFlows,
    ctx: &YearContext,
) -> f64 {
    if target_net <= 0.0 {
        return 0.0;
    }
    let balances = &mut state.balances;
    match kind {
        AccountKind::Tfsa => {
            let gross = balances.tfsa.min(target_net);
            balances.tfsa -= gross;
            flows.withdrawals.tfsa += gross;
            gross
        }
        AccountKind::NonRegistered => withdraw_from_nonreg_for_net(target_net, balances, flows, ctx),
        AccountKind::Lira if flows.age < LIF_ACCESS_AGE => 0.0,
        AccountKind::Rrsp | AccountKind::Rrif | AccountKind::Lira | AccountKind::Corporate => {
            let balance = match kind {
                AccountKind::Rrsp => &mut balances.rrsp,
                AccountKind::Rrif => &mut balances.rrif,
                AccountKind::Lira => &mut balances.lira,
                _ => &mut balances.corporate,
            };
            let (gross, net) =
                gross_for_net(target_net, *balance, |g| net_from_taxable_gross(g, flows, ctx));
            *balance -= gross;
            flows.withdrawals.add(kind, gross);
            flows.taxable_own += gross;
            if flows.age >= SPLIT_ELIGIBLE_AGE && matches!(kind, AccountKind::Rrif | AccountKind::Lira) {
                flows.split_eligible += gross;
            }
            net
        }
    }
}

fn gross_for_net(target_net: f64, available: f64, net_of: impl Fn(f64) -> f64) -> (f64, f64) {
    if target_net <= 0.0 || available <= 0.0 {
        return (0.0, 0.0);
    }
    let max_net = net_of(available);
    if max_net <= target_net {
        return (available, max_net);
    }

    let mut lo = 0.0;
    let mut hi = available;
    for _ in 0..40 {
        let mid = (lo + hi) * 0.5;
        if net_of(mid) < target_net {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    let gross = hi.min(available);
    (gross, net_of(gross))
}

fn net_from_taxable_gross(additional_gross: f64, flows: &PersonFlows, ctx: &YearContext) -> f64 {
    if additional_gross <= 0.0 {
        return 0.0;
    }
    let before = flows.taxable_income();
    let incremental_tax = (ctx.tax_on(before + additional_gross) - ctx.tax_on(before)).max(0.0);
    (additional_gross - incremental_tax).max(0.0)
}

fn net_from_investment_sale(
    gross_sale: f64,
    value: f64,
    acb: f64,
    flows: &PersonFlows,
    ctx: &YearContext,
) -> f64 {
    if gross_sale <= 0.0 || value <= 0.0 {
        return 0.0;
    }
    let gross = gross_sale.min(value);
    let basis_portion = (acb * (gross / value)).min(acb);
    let taxable_gain = taxable_capital_gain(gross - basis_portion, &ctx.tables);
    if taxable_gain <= 0.0 {
        return gross;
    }
    let before = flows.taxable_income();
    let incremental_tax = (ctx.tax_on(before + taxable_gain) - ctx.tax_on(before)).max(0.0);
    (gross - incremental_tax).max(0.0)
}

fn withdraw_from_nonreg_for_net(
    target_net: f64,
    balances: &mut AccountBalances,
    flows: &mut PersonFlows,
    ctx: &YearContext,
) -> f64 {
    let mut raised = 0.0;
    let mut gross_total = 0.0;
    for bucket in [&mut balances.nonreg_cash, &mut balances.nonreg_gic] {
        let take = bucket.min(target_net - raised).max(0.0);
        *bucket -= take;
        raised += take;
        gross_total += take;
    }

    let need = target_net - raised;
    if need > 0.0 && balances.nonreg_invest > 0.0 {
        let value = balances.nonreg_invest;
        let acb = balances.nonreg_acb.min(value);
        let (gross, net) = gross_for_net(need, value, |g| {
            net_from_investment_sale(g, value, acb, flows, ctx)
        });
        let basis_portion = (acb * (gross / value)).min(acb);
        let gain = gross - basis_portion;
        balances.nonreg_invest -= gross;
        balances.nonreg_acb = (acb - basis_portion).max(0.0).min(balances.nonreg_invest);
        flows.realized_gain += gain;
        flows.taxable_own += taxable_capital_gain(gain, &ctx.tables);
        raised += net;
        gross_total += gross;
    }

    flows.withdrawals.non_registered += gross_total;
    raised
}

fn reinvest_surplus(
    surplus: f64,
    states: &mut [PersonState],
    general_index: f64,
    tables: &BenefitTables,
) -> f64 {
    if surplus <= 0.0 {
        return 0.0;
    }
    let mut left = surplus;
    for state in states.iter_mut() {
        let room = state
            .person
            .tfsa_room_annual
            .map(|r| r * general_index)
            .unwrap_or(tables.tfsa_annual_room);
        let deposit = left.min(room.max(0.0));
        state.balances.tfsa += deposit;
        left -= deposit;
    }
    if let Some(primary) = states.first_mut() {
        primary.balances.nonreg_cash += left;
    }
    surplus
}

fn apply_growth(balances: &mut AccountBalances, returns: &AccountReturns) {
    balances.rrsp *= 1.0 + returns.rrsp;
    balances.rrif *= 1.0 + returns.rrif;
    balances.tfsa *= 1.0 + returns.tfsa;
    balances.lira *= 1.0 + returns.lira;
    balances.corporate *= 1.0 + returns.corporate;
    balances.nonreg_cash *= 1.0 + returns.nonreg_cash;
    balances.nonreg_gic *= 1.0 + returns.nonreg_gic;
    balances.nonreg_invest *= 1.0 + returns.nonreg_invest;
}

#[allow(clippy::too_many_arguments)]
fn build_year(
    year: i32,
    year_index: u32,
    primary_age: u32,
    spending_need: f64,
    spending_funded: f64,
    surplus_reinvested: f64,
    success: bool,
    people: Vec<PersonYear>,
) -> ProjectionYear {
    let mut income = IncomeBySource::default();
    let mut withdrawals = AccountAmounts::default();
    let mut ending_balances = AccountAmounts::default();
    let mut taxable_income = 0.0;
    let mut tax_paid = 0.0;
    let mut oas_clawback = 0.0;
    for p in &people {
        income.accumulate(&p.income);
        withdrawals.accumulate(&p.withdrawals);
        ending_balances.accumulate(&p.ending_balances);
        taxable_income += p.taxable_income;
        tax_paid += p.income_tax;
        oas_clawback += p.oas_clawback;
    }

    ProjectionYear {
        year,
        year_index,
        primary_age,
        spouse_age: people.get(1).map(|p| p.age),
        spending_need,
        spending_funded,
        income,
        withdrawals,
        taxable_income,
        tax_paid,
        oas_clawback,
        surplus_reinvested,
        total_ending_balance: ending_balances.total(),
        ending_balances,
        success,
        people,
    }
}

fn first_non_finite(record: &ProjectionYear) -> Option<&'static str> {
    let b = &record.ending_balances;
    [
        ("rrsp", b.rrsp),
        ("rrif", b.rrif),
        ("tfsa", b.tfsa),
        ("lira", b.lira),
        ("non_registered", b.non_registered),
        ("corporate", b.corporate),
        ("spending_need", record.spending_need),
        ("taxable_income", record.taxable_income),
        ("tax_paid", record.tax_paid),
        ("income", record.income.total()),
        ("withdrawals", record.withdrawals.total()),
    ]
    .into_iter()
    .find(|(_, value)| !value.is_finite())
    .map(|(field, _)| field)
}

fn summarize(
    years: Vec<ProjectionYear>,
    depletion_age: Option<u32>,
    fault: Option<NumericFault>,
    general_inflation: f64,
) -> ProjectionSummary {
    let years_simulated = years.len() as u32;
    let years_funded = years.iter().filter(|y| y.success).count() as u32;
    let total_income: f64 = years
        .iter()
        .map(|y| y.income.total() + y.withdrawals.total())
        .sum();
    let total_tax: f64 = years.iter().map(|y| y.tax_paid + y.oas_clawback).sum();
    let total_taxable: f64 = years.iter().map(|y| y.taxable_income).sum();
    let total_benefits: f64 = years.iter().map(|y| y.income.government_benefits()).sum();
    let final_estate = years.last().map(|y| y.total_ending_balance).unwrap_or(0.0);
    let final_estate_real = final_estate / (1.0 + general_inflation).powi(years_simulated as i32);

    let funded_ratio = if years_simulated == 0 {
        0.0
    } else {
        years_funded as f64 / years_simulated as f64
    };
    let estate_points = if final_estate > 0.0 { 20.0 } else { 0.0 };
    let health_score = (80.0 * funded_ratio + estate_points).round() as u32;

    ProjectionSummary {
        success: years_funded == years_simulated && fault.is_none(),
        assets_depleted: depletion_age.is_some(),
        depletion_age,
        total_income,
        total_tax,
        total_benefits,
        final_estate,
        final_estate_real,
        years_funded,
        years_simulated,
        health_score,
        avg_effective_tax_rate: if total_taxable > 0.0 {
            total_tax / total_taxable
        } else {
            0.0
        },
        fault,
        years,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{CppHistory, MaritalStatus, SpendingSchedule};
    use proptest::prelude::{prop_assert, proptest};

    fn assert_approx_tol(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    fn flat_returns(rate: f64) -> AccountReturns {
        AccountReturns {
            rrsp: rate,
            rrif: rate,
            tfsa: rate,
            lira: rate,
            corporate: rate,
            nonreg_cash: rate,
            nonreg_gic: rate,
            nonreg_invest: rate,
        }
    }

    fn zero_growth_person(name: &str, age: u32) -> Person {
        let mut person = Person::new(name, age);
        person.returns = flat_returns(0.0);
        person.years_in_canada = 0;
        person.cpp_history = CppHistory::default();
        person
    }

    fn single(person: Person, end_age: u32) -> Household {
        Household {
            people: vec![person],
            province: Province::Ontario,
            marital_status: MaritalStatus::Single,
            start_year: 2025,
            end_age,
            general_inflation: 0.0,
        }
    }

    fn strategy(name: &str, spending: f64) -> Strategy {
        Strategy::named(name, SpendingSchedule::flat(spending, 0.0)).expect("preset")
    }

    fn sample_household() -> Household {
        let mut a = Person::new("Alex", 63);
        a.cpp_history = CppHistory::Summary {
            average_indexed_earnings: 65_000.0,
            contributory_years: 36.0,
        };
        a.balances.rrsp = 450_000.0;
        a.balances.tfsa = 95_000.0;
        a.balances.nonreg_invest = 120_000.0;
        a.balances.nonreg_acb = 80_000.0;
        a.balances.nonreg_cash = 15_000.0;

        let mut b = Person::new("Sam", 61);
        b.cpp_history = CppHistory::Summary {
            average_indexed_earnings: 40_000.0,
            contributory_years: 30.0,
        };
        b.balances.rrsp = 180_000.0;
        b.balances.tfsa = 70_000.0;
        b.balances.lira = 60_000.0;

        Household {
            people: vec![a, b],
            province: Province::BritishColumbia,
            marital_status: MaritalStatus::Married,
            start_year: 2025,
            end_age: 95,
            general_inflation: 0.02,
        }
    }

    #[test]
    fn zero_balances_with_unmet_need_deplete_in_year_one() {
        let household = single(zero_growth_person("A", 60), 70);
        let summary =
            run_projection(&household, &strategy("balanced", 30_000.0), &BenefitTableSet::builtin())
                .expect("projection");
        assert!(summary.assets_depleted);
        assert_eq!(summary.depletion_age, Some(60));
        assert!(!summary.years[0].success);
        assert!(!summary.success);
        assert_eq!(summary.years.len(), 11);
        assert_eq!(summary.years_funded, 0);
    }

    #[test]
    fn tfsa_only_plan_runs_dry_on_schedule() {
        let mut person = zero_growth_person("A", 65);
        person.balances.tfsa = 100_000.0;
        let household = single(person, 80);
        let summary =
            run_projection(&household, &strategy("balanced", 10_000.0), &BenefitTableSet::builtin())
                .expect("projection");

        assert_eq!(summary.years_simulated, 16);
        assert_eq!(summary.years_funded, 10);
        assert_eq!(summary.depletion_age, Some(75));
        assert_approx_tol(summary.final_estate, 0.0, 1e-6);
        assert_eq!(summary.health_score, 50);
        assert_eq!(summary.total_tax, 0.0);
        assert_approx_tol(summary.years[0].withdrawals.tfsa, 10_000.0, 1e-6);
    }

    #[test]
    fn taxable_withdrawals_are_grossed_up_to_cover_need() {
        let mut person = zero_growth_person("A", 65);
        person.balances.rrsp = 1_000_000.0;
        let household = single(person, 66);
        let summary =
            run_projection(&household, &strategy("rrif-frontload", 60_000.0), &BenefitTableSet::builtin())
                .expect("projection");
        let first = &summary.years[0];
        let gross = first.withdrawals.rrsp;
        assert!(gross > 60_000.0);
        assert_approx_tol(gross - first.tax_paid, 60_000.0, 0.01);
        assert!(first.success);
        assert_approx_tol(first.surplus_reinvested, 0.0, 0.01);
    }

    #[test]
    fn rrsp_converts_at_72_and_minimum_surplus_is_reinvested() {
        let mut person = zero_growth_person("A", 72);
        person.balances.rrsp = 500_000.0;
        let household = single(person, 72);
        let summary =
            run_projection(&household, &strategy("tfsa-first", 0.0), &BenefitTableSet::builtin())
                .expect("projection");
        let first = &summary.years[0];
        let minimum = 500_000.0 * rrif_minimum_factor(72);
        assert_approx_tol(first.withdrawals.rrif, minimum, 1e-6);
        assert_eq!(first.ending_balances.rrsp, 0.0);
        assert_approx_tol(first.ending_balances.rrif, 500_000.0 - minimum, 1e-6);
        let net = minimum - first.tax_paid;
        assert_approx_tol(first.surplus_reinvested, net, 1e-6);
        assert_approx_tol(first.ending_balances.tfsa, 7_000.0, 1e-6);
        assert_approx_tol(first.ending_balances.non_registered, net - 7_000.0, 1e-6);
    }

    #[test]
    fn locked_in_account_is_untouched_before_55() {
        let mut person = zero_growth_person("A", 50);
        person.balances.lira = 200_000.0;
        let household = single(person, 52);
        let summary =
            run_projection(&household, &strategy("balanced", 20_000.0), &BenefitTableSet::builtin())
                .expect("projection");
        assert!(summary.years.iter().all(|y| y.withdrawals.lira == 0.0));
        assert!(!summary.success);
        assert_eq!(summary.depletion_age, None);
    }

    #[test]
    fn first_year_clawback_uses_supplied_prior_income() {
        let mut person = zero_growth_person("A", 66);
        person.years_in_canada = 40;
        person.prior_year_income = Some(250_000.0);
        person.balances.tfsa = 500_000.0;
        let household = single(person, 67);
        let summary =
            run_projection(&household, &strategy("tfsa-first", 30_000.0), &BenefitTableSet::builtin())
                .expect("projection");
        let y0 = &summary.years[0];
        let y1 = &summary.years[1];
        assert_approx_tol(y0.income.oas, 0.0, 1e-6);
        assert!(y0.oas_clawback > 0.0);
        assert_eq!(y1.oas_clawback, 0.0);
        assert_approx_tol(y1.income.oas, 727.67 * 12.0, 1e-6);
    }

    #[test]
    fn itemised_prior_year_keeps_cpp_exemption_for_gis() {
        let base = || {
            let mut person = zero_growth_person("A", 70);
            person.years_in_canada = 40;
            person.balances.tfsa = 200_000.0;
            person
        };
        let mut lump = base();
        lump.prior_year_income = Some(5_000.0);
        let mut itemised = base();
        itemised.prior_year_sources = vec![IncomeItem {
            source: IncomeSource::Cpp,
            amount: 5_000.0,
        }];

        let run = |person: Person| {
            run_projection(&single(person, 71), &strategy("tfsa-first", 20_000.0), &BenefitTableSet::builtin())
                .expect("projection")
        };
        let lump_gis = run(lump).years[0].income.gis;
        let itemised_gis = run(itemised).years[0].income.gis;
        // The first 5,000 of CPP is exempt, so nothing is countable.
        assert_approx_tol(itemised_gis, 1_086.88 * 12.0, 1e-6);
        assert!(lump_gis < itemised_gis);
    }

    #[test]
    fn low_income_senior_receives_gis() {
        let mut person = zero_growth_person("A", 70);
        person.years_in_canada = 40;
        person.balances.tfsa = 200_000.0;
        let household = single(person, 71);
        let summary =
            run_projection(&household, &strategy("tfsa-first", 20_000.0), &BenefitTableSet::builtin())
                .expect("projection");
        assert_approx_tol(summary.years[0].income.gis, 1_086.88 * 12.0, 1e-6);
        assert!(summary.total_benefits > 0.0);
    }

    #[test]
    fn pension_splitting_lowers_household_tax() {
        let mut high = zero_growth_person("High", 70);
        high.employer_pension_annual = 120_000.0;
        let low = zero_growth_person("Low", 70);
        let household = Household {
            people: vec![high, low],
            province: Province::Ontario,
            marital_status: MaritalStatus::Married,
            start_year: 2025,
            end_age: 70,
            general_inflation: 0.0,
        };
        let no_split = strategy("balanced", 50_000.0);
        let mut split = no_split.clone();
        split.income_split_fraction = 0.5;

        let tables = BenefitTableSet::builtin();
        let base = run_projection(&household, &no_split, &tables).expect("base");
        let shared = run_projection(&household, &split, &tables).expect("split");
        assert!(shared.years[0].tax_paid < base.years[0].tax_paid);
        assert_approx_tol(shared.years[0].people[0].pension_split_out, 60_000.0, 1e-6);
        assert_approx_tol(shared.years[0].people[1].pension_split_in, 60_000.0, 1e-6);
    }

    #[test]
    fn claiming_override_moves_cpp_start() {
        let mut person = zero_growth_person("A", 60);
        person.cpp_annual_at_start = Some(12_000.0);
        person.balances.tfsa = 1_000_000.0;
        let household = single(person, 64);
        let mut plan = strategy("tfsa-first", 10_000.0);
        let tables = BenefitTableSet::builtin();

        let early = run_projection(&household, &plan, &tables).expect("early");
        assert_eq!(early.years[0].income.cpp, 0.0);

        plan.claiming_overrides = vec![Some(ClaimingAges {
            cpp_start_age: 60,
            oas_start_age: 65,
        })];
        let overridden = run_projection(&household, &plan, &tables).expect("override");
        assert_eq!(overridden.years[0].income.cpp, 12_000.0);
    }

    #[test]
    fn invalid_configuration_fails_before_simulating() {
        let household = single(zero_growth_person("A", 60), 70);
        let mut dup = strategy("balanced", 10_000.0);
        dup.withdrawal_order = vec![AccountKind::Tfsa, AccountKind::Tfsa];
        assert!(matches!(
            run_projection(&household, &dup, &BenefitTableSet::builtin()),
            Err(EngineError::InputValidation { .. })
        ));

        let mut bad_age = household.clone();
        bad_age.people[0].claiming.cpp_start_age = 71;
        assert!(run_projection(&bad_age, &strategy("balanced", 1.0), &BenefitTableSet::builtin()).is_err());

        let mut too_long = household.clone();
        too_long.end_age = 120;
        assert!(run_projection(&too_long, &strategy("balanced", 1.0), &BenefitTableSet::builtin()).is_err());

        let mut early_year = household;
        early_year.start_year = 2010;
        assert!(matches!(
            run_projection(&early_year, &strategy("balanced", 1.0), &BenefitTableSet::builtin()),
            Err(EngineError::MissingTables(2010))
        ));
    }

    #[test]
    fn birth_year_contradicting_current_age_is_rejected() {
        let mut person = zero_growth_person("A", 65);
        person.birth_year = Some(1990);
        let household = single(person, 95);
        let err = run_projection(&household, &strategy("balanced", 1.0), &BenefitTableSet::builtin())
            .expect_err("contradiction");
        assert!(matches!(err, EngineError::InputValidation { ref field, .. } if field == "birth_year"));
    }

    #[test]
    fn birth_year_within_a_birthday_runs_to_end_age() {
        for born in [1959, 1960] {
            let mut person = zero_growth_person("A", 65);
            person.balances.tfsa = 1_000_000.0;
            person.birth_year = Some(born);
            let household = single(person, 95);
            let summary =
                run_projection(&household, &strategy("balanced", 1.0), &BenefitTableSet::builtin())
                    .expect("projection");
            let first = summary.years.first().expect("first year");
            let last = summary.years.last().expect("last year");
            assert_eq!(first.primary_age, (2025 - born) as u32);
            assert_eq!(last.primary_age, 95);
        }
    }

    #[test]
    fn overflow_aborts_with_fault_marker() {
        let mut person = zero_growth_person("A", 60);
        person.balances.tfsa = 1e200;
        person.returns.tfsa = 1e200;
        let household = single(person, 70);
        let summary =
            run_projection(&household, &strategy("tfsa-first", 10_000.0), &BenefitTableSet::builtin())
                .expect("projection");
        let fault = summary.fault.as_ref().expect("fault");
        assert_eq!(fault.year, 2025);
        assert_eq!(fault.age, 60);
        assert_eq!(fault.field, "tfsa");
        assert!(summary.years.is_empty());
        assert!(!summary.success);
    }

    #[test]
    fn sample_household_produces_ordered_years() {
        let household = sample_household();
        let plan = strategy("balanced", 85_000.0);
        let summary = run_projection(&household, &plan, &BenefitTableSet::builtin()).expect("run");
        assert_eq!(summary.years.len(), 33);
        for (i, year) in summary.years.iter().enumerate() {
            assert_eq!(year.year, 2025 + i as i32);
            assert_eq!(year.primary_age, 63 + i as u32);
            assert_eq!(year.spouse_age, Some(61 + i as u32));
        }
        assert!(summary.health_score <= 100);
        assert!(summary.final_estate_real <= summary.final_estate);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(24))]

        #[test]
        fn prop_projection_outputs_are_finite_and_non_negative(
            age in 55u32..75,
            horizon in 1u32..30,
            rrsp in 0u32..800_000,
            tfsa in 0u32..200_000,
            invest in 0u32..300_000,
            spending in 10_000u32..120_000,
            growth_bp in -300i32..900,
            inflation_bp in 0u32..500,
            order_idx in 0usize..5,
        ) {
            let mut person = Person::new("P", age);
            person.cpp_history = CppHistory::Summary {
                average_indexed_earnings: 55_000.0,
                contributory_years: 35.0,
            };
            person.balances.rrsp = rrsp as f64;
            person.balances.tfsa = tfsa as f64;
            person.balances.nonreg_invest = invest as f64;
            person.balances.nonreg_acb = invest as f64 * 0.6;
            person.returns = flat_returns(growth_bp as f64 / 10_000.0);
            let mut household = single(person, age + horizon);
            household.general_inflation = inflation_bp as f64 / 10_000.0;

            let names = ["balanced", "rrif-frontload", "tfsa-first", "capital-gains-optimized", "corporate-optimized"];
            let plan = Strategy::named(
                names[order_idx],
                SpendingSchedule::flat(spending as f64, household.general_inflation),
            ).expect("preset");
            let summary = run_projection(&household, &plan, &BenefitTableSet::builtin()).expect("run");

            prop_assert!(summary.fault.is_none());
            prop_assert!(summary.years.len() as u32 == horizon + 1);
            prop_assert!(summary.health_score <= 100);
            for year in &summary.years {
                prop_assert!(year.total_ending_balance >= -1e-6);
                prop_assert!(year.tax_paid >= 0.0);
                prop_assert!(year.spending_funded <= year.spending_need + 1e-6);
                for kind in AccountKind::ALL {
                    prop_assert!(year.ending_balances.get(kind) >= -1e-6);
                }
            }
        }

        #[test]
        fn prop_higher_spending_never_raises_final_estate(
            tfsa in 0u32..400_000,
            rrsp in 0u32..400_000,
            spending in 5_000u32..60_000,
            extra in 1u32..20_000,
        ) {
            let mut person = zero_growth_person("P", 66);
            person.balances.tfsa = tfsa as f64;
            person.balances.rrsp = rrsp as f64;
            let household = single(person, 75);
            let tables = BenefitTableSet::builtin();
            let lean = run_projection(&household, &strategy("balanced", spending as f64), &tables).expect("lean");
            let rich = run_projection(&household, &strategy("balanced", (spending + extra) as f64), &tables).expect("rich");
            prop_assert!(rich.final_estate <= lean.final_estate + 1.0);
        }
    }
}
