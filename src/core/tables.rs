use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::{EngineError, EngineResult};
use super::types::Province;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CppParams {
    pub ympe: f64,
    pub max_monthly_at_65: f64,
    pub full_contributory_years: f64,
    pub dropout_fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OasParams {
    pub max_monthly: f64,
    pub clawback_threshold: f64,
    pub recovery_rate: f64,
    pub age_75_bonus: f64,
    pub full_residency_years: u32,
    pub min_residency_years: u32,
    pub deferral_rate_per_month: f64,
    pub max_deferral_months: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GisParams {
    pub max_monthly_single: f64,
    pub max_monthly_couple_both_oas: f64,
    pub max_monthly_couple_spouse_no_oas: f64,
    pub income_cutoff_single: f64,
    pub income_cutoff_couple_both_oas: f64,
    pub income_cutoff_couple_spouse_no_oas: f64,
    pub reduction_rate_single: f64,
    pub reduction_rate_couple: f64,
    pub cpp_exemption: f64,
    pub employment_exemption_full: f64,
    pub employment_exemption_partial: f64,
    pub employment_partial_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaxBracket {
    pub threshold: f64,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxSchedule {
    pub basic_personal_amount: f64,
    pub brackets: Vec<TaxBracket>,
}

impl TaxSchedule {
    fn new(basic_personal_amount: f64, brackets: &[(f64, f64)]) -> Self {
        Self {
            basic_personal_amount,
            brackets: brackets
                .iter()
                .map(|&(threshold, rate)| TaxBracket { threshold, rate })
                .collect(),
        }
    }

    pub fn lowest_rate(&self) -> f64 {
        self.brackets.first().map(|b| b.rate).unwrap_or(0.0)
    }

    fn scaled(&self, factor: f64) -> Self {
        Self {
            basic_personal_amount: self.basic_personal_amount * factor,
            brackets: self
                .brackets
                .iter()
                .map(|b| TaxBracket {
                    threshold: b.threshold * factor,
                    rate: b.rate,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxParams {
    pub federal: TaxSchedule,
    pub quebec_abatement: f64,
    pub capital_gains_inclusion: f64,
    pub ontario: TaxSchedule,
    pub british_columbia: TaxSchedule,
    pub alberta: TaxSchedule,
    pub quebec: TaxSchedule,
}

impl TaxParams {
    pub fn provincial(&self, province: Province) -> &TaxSchedule {
        match province {
            Province::Ontario => &self.ontario,
            Province::BritishColumbia => &self.british_columbia,
            Province::Alberta => &self.alberta,
            Province::Quebec => &self.quebec,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenefitTables {
    pub year: i32,
    pub cpp: CppParams,
    pub oas: OasParams,
    pub gis: GisParams,
    pub tfsa_annual_room: f64,
    pub tax: TaxParams,
}

impl BenefitTables {
    pub fn year_2024() -> Self {
        Self {
            year: 2024,
            cpp: CppParams {
                ympe: 68_500.0,
                max_monthly_at_65: 1_364.60,
                full_contributory_years: 39.0,
                dropout_fraction: 0.17,
            },
            oas: oas_rules(713.34, 90_997.0),
            gis: GisParams {
                max_monthly_single: 1_065.47,
                max_monthly_couple_both_oas: 641.35,
                max_monthly_couple_spouse_no_oas: 1_065.47,
                income_cutoff_single: 21_624.0,
                income_cutoff_couple_both_oas: 28_560.0,
                income_cutoff_couple_spouse_no_oas: 51_840.0,
                ..gis_rules()
            },
            tfsa_annual_room: 7_000.0,
            tax: TaxParams {
                federal: TaxSchedule::new(
                    15_705.0,
                    &[
                        (0.0, 0.15),
                        (55_867.0, 0.205),
                        (111_733.0, 0.26),
                        (173_205.0, 0.29),
                        (246_752.0, 0.33),
                    ],
                ),
                quebec_abatement: 0.165,
                capital_gains_inclusion: 0.5,
                ontario: TaxSchedule::new(
                    12_399.0,
                    &[
                        (0.0, 0.0505),
                        (51_446.0, 0.0915),
                        (102_894.0, 0.1116),
                        (150_000.0, 0.1216),
                        (220_000.0, 0.1316),
                    ],
                ),
                british_columbia: TaxSchedule::new(
                    12_580.0,
                    &[
                        (0.0, 0.0506),
                        (47_937.0, 0.077),
                        (95_875.0, 0.105),
                        (110_076.0, 0.1229),
                        (133_664.0, 0.147),
                        (181_232.0, 0.168),
                        (252_752.0, 0.205),
                    ],
                ),
                alberta: TaxSchedule::new(
                    21_885.0,
                    &[
                        (0.0, 0.10),
                        (148_269.0, 0.12),
                        (177_922.0, 0.13),
                        (237_230.0, 0.14),
                        (355_845.0, 0.15),
                    ],
                ),
                quebec: TaxSchedule::new(
                    18_056.0,
                    &[
                        (0.0, 0.14),
                        (51_780.0, 0.19),
                        (103_545.0, 0.24),
                        (126_000.0, 0.2575),
                    ],
                ),
            },
        }
    }

    pub fn year_2025() -> Self {
        Self {
            year: 2025,
            cpp: CppParams {
                ympe: 71_300.0,
                max_monthly_at_65: 1_433.00,
                full_contributory_years: 39.0,
                dropout_fraction: 0.17,
            },
            oas: oas_rules(727.67, 93_454.0),
            gis: GisParams {
                max_monthly_single: 1_086.88,
                max_monthly_couple_both_oas: 654.23,
                max_monthly_couple_spouse_no_oas: 1_086.88,
                income_cutoff_single: 22_056.0,
                income_cutoff_couple_both_oas: 29_136.0,
                income_cutoff_couple_spouse_no_oas: 52_848.0,
                ..gis_rules()
            },
            tfsa_annual_room: 7_000.0,
            tax: TaxParams {
                federal: TaxSchedule::new(
                    16_129.0,
                    &[
                        (0.0, 0.15),
                        (57_375.0, 0.205),
                        (114_750.0, 0.26),
                        (177_882.0, 0.29),
                        (253_414.0, 0.33),
                    ],
                ),
                quebec_abatement: 0.165,
                capital_gains_inclusion: 0.5,
                ontario: TaxSchedule::new(
                    12_747.0,
                    &[
                        (0.0, 0.0505),
                        (52_886.0, 0.0915),
                        (105_775.0, 0.1116),
                        (150_000.0, 0.1216),
                        (220_000.0, 0.1316),
                    ],
                ),
                british_columbia: TaxSchedule::new(
                    12_932.0,
                    &[
                        (0.0, 0.0506),
                        (49_279.0, 0.077),
                        (98_560.0, 0.105),
                        (113_158.0, 0.1229),
                        (137_407.0, 0.147),
                        (186_306.0, 0.168),
                        (259_829.0, 0.205),
                    ],
                ),
                alberta: TaxSchedule::new(
                    22_323.0,
                    &[
                        (0.0, 0.10),
                        (151_234.0, 0.12),
                        (181_481.0, 0.13),
                        (241_974.0, 0.14),
                        (362_961.0, 0.15),
                    ],
                ),
                quebec: TaxSchedule::new(
                    18_571.0,
                    &[
                        (0.0, 0.14),
                        (53_255.0, 0.19),
                        (106_495.0, 0.24),
                        (129_590.0, 0.2575),
                    ],
                ),
            },
        }
    }

    pub fn indexed(&self, factor: f64) -> Self {
        let cpp = CppParams {
            ympe: self.cpp.ympe * factor,
            max_monthly_at_65: self.cpp.max_monthly_at_65 * factor,
            ..self.cpp.clone()
        };
        let oas = OasParams {
            max_monthly: self.oas.max_monthly * factor,
            clawback_threshold: self.oas.clawback_threshold * factor,
            ..self.oas.clone()
        };
        let g = &self.gis;
        let gis = GisParams {
            max_monthly_single: g.max_monthly_single * factor,
            max_monthly_couple_both_oas: g.max_monthly_couple_both_oas * factor,
            max_monthly_couple_spouse_no_oas: g.max_monthly_couple_spouse_no_oas * factor,
            income_cutoff_single: g.income_cutoff_single * factor,
            income_cutoff_couple_both_oas: g.income_cutoff_couple_both_oas * factor,
            income_cutoff_couple_spouse_no_oas: g.income_cutoff_couple_spouse_no_oas * factor,
            cpp_exemption: g.cpp_exemption * factor,
            employment_exemption_full: g.employment_exemption_full * factor,
            employment_exemption_partial: g.employment_exemption_partial * factor,
            ..g.clone()
        };
        let t = &self.tax;
        let tax = TaxParams {
            federal: t.federal.scaled(factor),
            quebec_abatement: t.quebec_abatement,
            capital_gains_inclusion: t.capital_gains_inclusion,
            ontario: t.ontario.scaled(factor),
            british_columbia: t.british_columbia.scaled(factor),
            alberta: t.alberta.scaled(factor),
            quebec: t.quebec.scaled(factor),
        };

        Self {
            year: self.year,
            cpp,
            oas,
            gis,
            tfsa_annual_room: self.tfsa_annual_room * factor,
            tax,
        }
    }
}

fn oas_rules(max_monthly: f64, clawback_threshold: f64) -> OasParams {
    OasParams {
        max_monthly,
        clawback_threshold,
        recovery_rate: 0.15,
        age_75_bonus: 0.10,
        full_residency_years: 40,
        min_residency_years: 10,
        deferral_rate_per_month: 0.006,
        max_deferral_months: 60,
    }
}

fn gis_rules() -> GisParams {
    GisParams {
        max_monthly_single: 0.0,
        max_monthly_couple_both_oas: 0.0,
        max_monthly_couple_spouse_no_oas: 0.0,
        income_cutoff_single: 0.0,
        income_cutoff_couple_both_oas: 0.0,
        income_cutoff_couple_spouse_no_oas: 0.0,
        reduction_rate_single: 0.50,
        reduction_rate_couple: 0.25,
        cpp_exemption: 5_000.0,
        employment_exemption_full: 5_000.0,
        employment_exemption_partial: 10_000.0,
        employment_partial_rate: 0.50,
    }
}

#[derive(Debug, Clone)]
pub struct BenefitTableSet {
    tables: BTreeMap<i32, BenefitTables>,
}

impl Default for BenefitTableSet {
    fn default() -> Self {
        Self::builtin()
    }
}

impl BenefitTableSet {
    pub fn builtin() -> Self {
        Self::from_tables(vec![BenefitTables::year_2024(), BenefitTables::year_2025()])
    }

    pub fn from_tables(tables: Vec<BenefitTables>) -> Self {
        Self {
            tables: tables.into_iter().map(|t| (t.year, t)).collect(),
        }
    }

    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        let tables: Vec<BenefitTables> = serde_json::from_str(json)?;
        if tables.is_empty() {
            return Err(EngineError::TableLoad(
                "table file contains no benefit years".to_string(),
            ));
        }
        Ok(Self::from_tables(tables))
    }

    pub fn load(path: &Path) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::TableLoad(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    pub fn for_year(&self, year: i32) -> EngineResult<&BenefitTables> {
        self.tables
            .range(..=year)
            .next_back()
            .map(|(_, t)| t)
            .ok_or(EngineError::MissingTables(year))
    }

    pub fn latest(&self) -> Option<&BenefitTables> {
        self.tables.values().next_back()
    }

    pub fn years(&self) -> Vec<i32> {
        self.tables.keys().copied().collect()
    }
}

pub fn rrif_minimum_factor(age: u32) -> f64 {
    const FACTORS_71_TO_94: [f64; 24] = [
        0.0528, 0.0540, 0.0553, 0.0567, 0.0582, 0.0598, 0.0617, 0.0636, 0.0658, 0.0682, 0.0708,
        0.0738, 0.0771, 0.0808, 0.0851, 0.0899, 0.0955, 0.1021, 0.1099, 0.1192, 0.1306, 0.1449,
        0.1634, 0.1879,
    ];
    match age {
        0..=70 => 1.0 / (90 - age.min(89)) as f64,
        71..=94 => FACTORS_71_TO_94[(age - 71) as usize],
        _ => 0.20,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_falls_back_to_latest_earlier_year() {
        let set = BenefitTableSet::builtin();
        assert_eq!(set.for_year(2024).expect("2024").year, 2024);
        assert_eq!(set.for_year(2031).expect("2031").year, 2025);
        assert!(matches!(
            set.for_year(2019),
            Err(EngineError::MissingTables(2019))
        ));
    }

    #[test]
    fn indexing_scales_money_but_not_rates() {
        let base = BenefitTables::year_2025();
        let indexed = base.indexed(1.10);
        assert!((indexed.cpp.ympe - 78_430.0).abs() < 1e-6);
        assert!((indexed.oas.clawback_threshold - 93_454.0 * 1.10).abs() < 1e-6);
        assert_eq!(indexed.oas.recovery_rate, base.oas.recovery_rate);
        assert_eq!(indexed.tax.federal.brackets[1].rate, 0.205);
        assert!((indexed.tax.federal.brackets[1].threshold - 57_375.0 * 1.10).abs() < 1e-6);
        assert_eq!(indexed.gis.reduction_rate_single, 0.50);
    }

    #[test]
    fn rrif_factors_follow_legislated_schedule() {
        assert!((rrif_minimum_factor(65) - 0.04).abs() < 1e-12);
        assert!((rrif_minimum_factor(71) - 0.0528).abs() < 1e-12);
        assert!((rrif_minimum_factor(94) - 0.1879).abs() < 1e-12);
        assert!((rrif_minimum_factor(101) - 0.20).abs() < 1e-12);
    }

    #[test]
    fn json_tables_round_trip_through_loader() {
        let json = serde_json::to_string(&vec![BenefitTables::year_2025()]).expect("serialize");
        let set = BenefitTableSet::from_json_str(&json).expect("parse");
        assert_eq!(set.years(), vec![2025]);
        assert_eq!(set.latest(), Some(&BenefitTables::year_2025()));
    }

    #[test]
    fn empty_table_file_is_rejected() {
        assert!(matches!(
            BenefitTableSet::from_json_str("[]"),
            Err(EngineError::TableLoad(_))
        ));
    }
}
