mod cpp;
mod engine;
mod error;
mod gis;
mod oas;
mod scenario;
mod solver;
mod tables;
mod tax;
mod types;

pub use cpp::{
    AgeCandidate, BreakEven, HistorySummary, OptimalAge, adjustment_factor,
    calculate_break_even_age, estimate_cpp, estimate_cpp_from_history,
    find_optimal_cpp_start_age, summarize_history,
};
pub use engine::{run_projection, validate};
pub use error::{EngineError, EngineResult};
pub use gis::{
    GisCategory, GisIncome, GisIncomeLine, IncomeItem, IncomeSource, calculate_gis,
    calculate_gis_income, is_eligible_for_gis,
};
pub use oas::{calculate_net_oas, calculate_oas_deferral};
pub use scenario::{
    ReturnTier, Scenario, ScenarioResult, TierComparison, apply_return_tier,
    compare_return_tiers, run_scenarios,
};
pub use solver::{ClaimingCandidate, ClaimingSearchResult, optimize_claiming_ages};
pub use tables::{BenefitTableSet, BenefitTables};
pub use tax::{TaxBreakdown, effective_rate, income_tax, marginal_rate};
pub use types::{
    AccountAmounts, AccountBalances, AccountKind, AccountReturns, BenefitEstimate, ClaimingAges,
    ContributionRecord, CppHistory, Eligibility, Household, IncomeBySource, MaritalStatus,
    NumericFault, Person, PersonYear, ProjectionSummary, ProjectionYear, Province,
    SpendingPhase, SpendingSchedule, Strategy, preset_withdrawal_order,
};
