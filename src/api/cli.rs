use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{Value, json};
use thiserror::Error;

use super::wire::{ProjectionPayload, ProjectionResponse};
use crate::core::{
    BenefitTableSet, BenefitTables, CppHistory, EngineError, EngineResult, MaritalStatus,
    ReturnTier, apply_return_tier, calculate_break_even_age, calculate_gis, calculate_net_oas,
    calculate_oas_deferral, compare_return_tiers, estimate_cpp, find_optimal_cpp_start_age,
    is_eligible_for_gis, optimize_claiming_ages, run_projection, summarize_history,
};

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("could not read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(std::io::Error),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CliMaritalStatus {
    Single,
    Married,
    CommonLaw,
    Widowed,
    Divorced,
    Separated,
}

impl From<CliMaritalStatus> for MaritalStatus {
    fn from(value: CliMaritalStatus) -> Self {
        match value {
            CliMaritalStatus::Single => MaritalStatus::Single,
            CliMaritalStatus::Married => MaritalStatus::Married,
            CliMaritalStatus::CommonLaw => MaritalStatus::CommonLaw,
            CliMaritalStatus::Widowed => MaritalStatus::Widowed,
            CliMaritalStatus::Divorced => MaritalStatus::Divorced,
            CliMaritalStatus::Separated => MaritalStatus::Separated,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CliReturnTier {
    Pessimistic,
    Neutral,
    Optimistic,
}

impl From<CliReturnTier> for ReturnTier {
    fn from(value: CliReturnTier) -> Self {
        match value {
            CliReturnTier::Pessimistic => ReturnTier::Pessimistic,
            CliReturnTier::Neutral => ReturnTier::Neutral,
            CliReturnTier::Optimistic => ReturnTier::Optimistic,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "retire",
    about = "Canadian retirement planner (CPP, OAS, GIS, tax and year-by-year projections)"
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        help = "JSON file with a list of benefit tables; defaults to the built-in 2024 and 2025 tables"
    )]
    pub tables: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(about = "Serve the JSON API")]
    Serve {
        #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
        bind: IpAddr,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    #[command(about = "Project a household plan read from a projection request JSON file")]
    Project {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, value_enum, help = "Shift every return by the tier's spread")]
        tier: Option<CliReturnTier>,
        #[arg(long, help = "Run pessimistic, neutral and optimistic returns side by side")]
        compare_tiers: bool,
    },
    #[command(about = "Estimate the CPP retirement pension")]
    Cpp {
        #[arg(long, help = "Average indexed pensionable earnings in dollars")]
        average_earnings: f64,
        #[arg(long, help = "Contributory years after dropout")]
        years: f64,
        #[arg(long, default_value_t = 65)]
        start_age: u32,
        #[arg(long)]
        current_age: Option<u32>,
        #[arg(long, help = "Also search for the start age with the largest lifetime value")]
        life_expectancy: Option<f64>,
        #[arg(long, help = "Annual discount rate as a fraction, e.g. 0.03")]
        discount_rate: Option<f64>,
        #[arg(long)]
        year: Option<i32>,
    },
    #[command(about = "Estimate OAS after the recovery tax, or the deferral increase")]
    Oas {
        #[arg(long)]
        years_in_canada: u32,
        #[arg(long, default_value_t = 0.0, help = "Net world income in dollars")]
        income: f64,
        #[arg(long, default_value_t = 65)]
        age: u32,
        #[arg(long, help = "Months deferred past 65; reports the deferred amount instead")]
        deferral_months: Option<u32>,
        #[arg(long)]
        year: Option<i32>,
    },
    #[command(about = "Estimate the Guaranteed Income Supplement")]
    Gis {
        #[arg(long, help = "Countable income in dollars, OAS excluded")]
        income: f64,
        #[arg(long, value_enum, default_value_t = CliMaritalStatus::Single)]
        marital_status: CliMaritalStatus,
        #[arg(long)]
        spouse_receives_oas: bool,
        #[arg(long, help = "Also report eligibility at this age")]
        age: Option<u32>,
        #[arg(long)]
        year: Option<i32>,
    },
    #[command(about = "Find the age at which a later CPP start catches up with an earlier one")]
    BreakEven {
        #[arg(long)]
        average_earnings: f64,
        #[arg(long)]
        years: f64,
        #[arg(long)]
        age_a: u32,
        #[arg(long)]
        age_b: u32,
        #[arg(long, default_value_t = 100)]
        horizon_age: u32,
        #[arg(long)]
        year: Option<i32>,
    },
    #[command(about = "Search CPP start ages 60 to 70 against full projections")]
    Optimize {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value_t = 0)]
        person_index: usize,
    },
}

pub async fn run_cli(cli: Cli) -> Result<(), CliError> {
    let tables = match &cli.tables {
        Some(path) => BenefitTableSet::load(path)?,
        None => BenefitTableSet::builtin(),
    };

    if let Command::Serve { bind, port } = cli.command {
        return super::run_http_server(SocketAddr::new(bind, port), tables)
            .await
            .map_err(CliError::Server);
    }

    let output = execute(&cli.command, &tables)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn execute(command: &Command, tables: &BenefitTableSet) -> Result<Value, CliError> {
    let value = match command {
        Command::Serve { .. } => Value::Null,
        Command::Project {
            input,
            tier,
            compare_tiers,
        } => {
            let (household, strategy) = read_plan(input)?.into_domain()?;
            if *compare_tiers {
                let tiers: Vec<Value> = compare_return_tiers(&household, &strategy, tables)?
                    .into_iter()
                    .map(|c| {
                        json!({
                            "tier": c.tier,
                            "return_shift": c.return_shift,
                            "summary": ProjectionResponse::from(c.summary).summary,
                        })
                    })
                    .collect();
                json!({ "tiers": tiers })
            } else {
                let household = match tier {
                    Some(tier) => apply_return_tier(&household, (*tier).into()),
                    None => household,
                };
                let summary = run_projection(&household, &strategy, tables)?;
                serde_json::to_value(ProjectionResponse::from(summary))?
            }
        }
        Command::Cpp {
            average_earnings,
            years,
            start_age,
            current_age,
            life_expectancy,
            discount_rate,
            year,
        } => {
            let year_tables = pick_tables(tables, *year)?;
            let estimate = estimate_cpp(
                *average_earnings,
                *years,
                *start_age,
                current_age.unwrap_or(*start_age),
                year_tables,
            )?;
            match life_expectancy {
                Some(life_expectancy) => {
                    let summary = summarize_history(
                        &CppHistory::Summary {
                            average_indexed_earnings: *average_earnings,
                            contributory_years: *years,
                        },
                        &year_tables.cpp,
                    )?;
                    let optimal = find_optimal_cpp_start_age(
                        &summary,
                        *life_expectancy,
                        *discount_rate,
                        current_age.unwrap_or(60),
                        year_tables,
                    )?;
                    json!({ "estimate": estimate, "optimal": optimal })
                }
                None => serde_json::to_value(estimate)?,
            }
        }
        Command::Oas {
            years_in_canada,
            income,
            age,
            deferral_months,
            year,
        } => {
            let year_tables = pick_tables(tables, *year)?;
            let estimate = match deferral_months {
                Some(months) => calculate_oas_deferral(*years_in_canada, *months, 65, year_tables)?,
                None => calculate_net_oas(*years_in_canada, *income, *age, year_tables)?,
            };
            serde_json::to_value(estimate)?
        }
        Command::Gis {
            income,
            marital_status,
            spouse_receives_oas,
            age,
            year,
        } => {
            let year_tables = pick_tables(tables, *year)?;
            let status = MaritalStatus::from(*marital_status);
            let estimate = calculate_gis(*income, status, *spouse_receives_oas, year_tables)?;
            match age {
                Some(age) => {
                    let eligibility = is_eligible_for_gis(
                        *age,
                        true,
                        *income,
                        status,
                        *spouse_receives_oas,
                        year_tables,
                    );
                    json!({ "estimate": estimate, "eligibility": eligibility })
                }
                None => serde_json::to_value(estimate)?,
            }
        }
        Command::BreakEven {
            average_earnings,
            years,
            age_a,
            age_b,
            horizon_age,
            year,
        } => {
            let year_tables = pick_tables(tables, *year)?;
            let summary = summarize_history(
                &CppHistory::Summary {
                    average_indexed_earnings: *average_earnings,
                    contributory_years: *years,
                },
                &year_tables.cpp,
            )?;
            serde_json::to_value(calculate_break_even_age(
                &summary,
                *age_a,
                *age_b,
                *horizon_age,
                year_tables,
            )?)?
        }
        Command::Optimize {
            input,
            person_index,
        } => {
            let (household, strategy) = read_plan(input)?.into_domain()?;
            serde_json::to_value(optimize_claiming_ages(
                &household,
                &strategy,
                *person_index,
                tables,
            )?)?
        }
    };
    Ok(value)
}

fn pick_tables(tables: &BenefitTableSet, year: Option<i32>) -> EngineResult<&BenefitTables> {
    match year {
        Some(year) => tables.for_year(year),
        None => tables
            .latest()
            .ok_or_else(|| EngineError::TableLoad("no benefit tables loaded".to_string())),
    }
}

fn read_plan(path: &Path) -> Result<ProjectionPayload, CliError> {
    let raw = std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(args: &[&str]) -> Value {
        let cli = Cli::try_parse_from(args).expect("args should parse");
        execute(&cli.command, &BenefitTableSet::builtin()).expect("command should succeed")
    }

    #[test]
    fn serve_defaults_to_localhost_8080() {
        let cli = Cli::try_parse_from(["retire", "serve"]).expect("args should parse");
        match cli.command {
            Command::Serve { bind, port } => {
                assert_eq!(bind, IpAddr::V4(Ipv4Addr::LOCALHOST));
                assert_eq!(port, 8080);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(cli.tables.is_none());
    }

    #[test]
    fn tables_flag_is_global() {
        let cli = Cli::try_parse_from(["retire", "oas", "--years-in-canada", "40", "--tables", "t.json"])
            .expect("args should parse");
        assert_eq!(cli.tables, Some(PathBuf::from("t.json")));
    }

    #[test]
    fn cpp_at_70_applies_late_credit() {
        let out = run(&[
            "retire",
            "cpp",
            "--average-earnings",
            "71300",
            "--years",
            "39",
            "--start-age",
            "70",
        ]);
        let factor = out["adjustment_factor"].as_f64().expect("factor");
        assert!((factor - 1.42).abs() < 1e-12);
    }

    #[test]
    fn cpp_with_life_expectancy_reports_optimal_age() {
        let out = run(&[
            "retire",
            "cpp",
            "--average-earnings",
            "71300",
            "--years",
            "39",
            "--life-expectancy",
            "65",
        ]);
        assert_eq!(out["optimal"]["optimal_age"], 60);
    }

    #[test]
    fn oas_above_threshold_is_clawed_back() {
        let out = run(&[
            "retire",
            "oas",
            "--years-in-canada",
            "40",
            "--income",
            "103454",
        ]);
        let clawback = out["clawback_amount"].as_f64().expect("clawback");
        assert!((clawback - 1_500.0).abs() < 1e-6);
    }

    #[test]
    fn gis_accepts_marital_status_values() {
        let out = run(&[
            "retire",
            "gis",
            "--income",
            "0",
            "--marital-status",
            "common-law",
            "--spouse-receives-oas",
            "--age",
            "66",
        ]);
        assert_eq!(out["eligibility"]["eligible"], true);
        assert!(out["estimate"]["annual_amount"].as_f64().expect("amount") > 0.0);
    }

    #[test]
    fn break_even_subcommand_matches_library() {
        let out = run(&[
            "retire",
            "break-even",
            "--average-earnings",
            "80000",
            "--years",
            "40",
            "--age-a",
            "60",
            "--age-b",
            "65",
        ]);
        assert_eq!(out["break_even_age"], 74);
    }

    #[test]
    fn missing_input_file_is_a_read_error() {
        let cli = Cli::try_parse_from(["retire", "project", "--input", "/nonexistent/plan.json"])
            .expect("args should parse");
        let err = execute(&cli.command, &BenefitTableSet::builtin()).expect_err("missing file");
        assert!(matches!(err, CliError::Read { .. }));
    }
}
