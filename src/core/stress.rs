use std::collections::BTreeMap;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::error::StressError;
use super::projection::yearly_expenses;
use super::simulation::run_simulation;
use super::types::{Scenario, SimulationResult};

const TYPICAL_OUTCOME_WEIGHT: f64 = 10.0;
const PERSONAL_RECOVERY_BONUS: f64 = 15.0;
const MARKET_RECOVERY_BONUS: f64 = 10.0;
/// Upper bound, in years, for the `longevity_increase` lever.
const MAX_LONGEVITY_INCREASE: f64 = 50.0;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StressCategory {
    MarketRisk,
    PersonalRisk,
    InflationRisk,
    LongevityRisk,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    Mild,
    Moderate,
    Severe,
    Extreme,
}

impl Severity {
    fn recovery_factor(self) -> f64 {
        match self {
            Severity::Mild => 1.0,
            Severity::Moderate => 1.5,
            Severity::Severe => 2.0,
            Severity::Extreme => 3.0,
        }
    }
}

/// The named levers a stress scenario may pull. Rate levers are in
/// percentage points, reductions and declines in percent.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StressLever {
    InflationIncrease,
    RealReturnErosion,
    EquityReturnShock,
    BondReturnShock,
    ExpenseMultiplier,
    IncomeReduction,
    PortfolioDecline,
    PropertyDecline,
    LongevityIncrease,
}

impl FromStr for StressLever {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inflation_increase" => Ok(Self::InflationIncrease),
            "real_return_erosion" => Ok(Self::RealReturnErosion),
            "equity_return_shock" => Ok(Self::EquityReturnShock),
            "bond_return_shock" => Ok(Self::BondReturnShock),
            "expense_multiplier" => Ok(Self::ExpenseMultiplier),
            "income_reduction" => Ok(Self::IncomeReduction),
            "portfolio_decline" => Ok(Self::PortfolioDecline),
            "property_decline" => Ok(Self::PropertyDecline),
            "longevity_increase" => Ok(Self::LongevityIncrease),
            other => Err(format!("unknown stress lever `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StressScenario {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category: StressCategory,
    pub severity: Severity,
    pub duration_years: u32,
    #[serde(default)]
    pub parameters: BTreeMap<String, f64>,
}

impl StressScenario {
    fn new(
        id: &str,
        name: &str,
        description: &str,
        category: StressCategory,
        severity: Severity,
        duration_years: u32,
        parameters: &[(&str, f64)],
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            category,
            severity,
            duration_years,
            parameters: parameters
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }
}

/// Relative worsening of each lever, `(stressed - base) / base * 100`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpactAnalysis {
    pub portfolio_impact: f64,
    pub return_impact: f64,
    pub income_impact: f64,
    pub expense_impact: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StressTestResult {
    pub scenario_id: String,
    pub scenario_name: String,
    pub category: StressCategory,
    pub severity: Severity,
    pub survival_probability: f64,
    pub shortfall_risk: f64,
    pub worst_case: f64,
    pub median_final_wealth: f64,
    pub recovery_years: Option<u32>,
    pub resilience_score: f64,
    pub baseline_success_probability: f64,
    pub impact: ImpactAnalysis,
    pub stressed: SimulationResult,
}

/// Returns a copy of `base` with every lever in `stress` applied.
///
/// Rate deltas add, multipliers and percentage cuts scale. Applying the same
/// stress twice compounds: the result is not idempotent. Unknown parameter
/// names and non-positive multipliers are ignored.
pub fn apply_stress_parameters(base: &Scenario, stress: &StressScenario) -> Scenario {
    let mut scenario = base.clone();

    for (key, &value) in &stress.parameters {
        let lever = match key.parse::<StressLever>() {
            Ok(lever) => lever,
            Err(_) => {
                warn!(scenario = %stress.id, parameter = %key, "ignoring unknown stress parameter");
                continue;
            }
        };
        if !value.is_finite() {
            warn!(scenario = %stress.id, parameter = %key, "ignoring non-finite stress parameter");
            continue;
        }

        let assumptions = &mut scenario.assumptions;
        let flows = &mut scenario.flows;
        let balances = &mut scenario.balances;
        match lever {
            StressLever::InflationIncrease => assumptions.inflation_rate += value,
            StressLever::RealReturnErosion => {
                assumptions.equity_return += value;
                assumptions.bond_return += value;
            }
            StressLever::EquityReturnShock => assumptions.equity_return += value,
            StressLever::BondReturnShock => assumptions.bond_return += value,
            StressLever::ExpenseMultiplier => {
                if value <= 0.0 {
                    warn!(scenario = %stress.id, value, "ignoring non-positive expense multiplier");
                    continue;
                }
                flows.essential_expenses *= value;
                flows.lifestyle_expenses *= value;
                flows.discretionary_expenses *= value;
                flows.total_expenses *= value;
            }
            StressLever::IncomeReduction => {
                let keep = retained_share(value);
                flows.income *= keep;
                flows.other_income *= keep;
            }
            StressLever::PortfolioDecline => {
                let keep = retained_share(value);
                balances.investment_portfolio *= keep;
                balances.pension_pot *= keep;
            }
            StressLever::PropertyDecline => balances.property *= retained_share(value),
            StressLever::LongevityIncrease => {
                let years = value.round().clamp(0.0, MAX_LONGEVITY_INCREASE) as u32;
                scenario.time.life_expectancy = scenario.time.life_expectancy.saturating_add(years);
                scenario.time.projection_years =
                    scenario.time.projection_years.saturating_add(years);
            }
        }
    }

    scenario
}

pub fn analyze_impact(base: &Scenario, stressed: &Scenario) -> ImpactAnalysis {
    ImpactAnalysis {
        portfolio_impact: relative_change(base.liquid_wealth(), stressed.liquid_wealth()),
        return_impact: relative_change(expected_real_return(base), expected_real_return(stressed)),
        income_impact: relative_change(annual_income(base), annual_income(stressed)),
        expense_impact: relative_change(annual_expenses(base), annual_expenses(stressed)),
    }
}

/// Blends survival probability with where the typical outcome sits in the
/// p10-p90 band and a category-specific recovery bonus. Clamped to 0-100.
pub fn resilience_score(
    stress: &StressScenario,
    result: &SimulationResult,
    reference_wealth: f64,
) -> f64 {
    let p = &result.percentiles;
    let centre = (p.p10 + p.p90) / 2.0;
    let width = p.p90 - p.p10;
    let reference = if reference_wealth > 0.0 {
        reference_wealth
    } else {
        p.p10.abs().max(p.p90.abs()).max(1.0)
    };

    let typical = TYPICAL_OUTCOME_WEIGHT * (centre / reference).clamp(-1.0, 1.0);
    let category_bonus = match stress.category {
        StressCategory::PersonalRisk => {
            let closeness = if width > 0.0 {
                1.0 - ((p.p50 - centre).abs() / width).min(1.0)
            } else {
                1.0
            };
            PERSONAL_RECOVERY_BONUS * closeness
        }
        StressCategory::MarketRisk => {
            MARKET_RECOVERY_BONUS * (result.average_final_wealth / reference).clamp(0.0, 1.0)
        }
        StressCategory::InflationRisk | StressCategory::LongevityRisk => 0.0,
    };

    (result.success_probability + typical + category_bonus).clamp(0.0, 100.0)
}

/// Years for the median path to get back on trend, estimated from the
/// stress duration and severity. `None` when the median outcome is depleted.
pub fn estimate_recovery_years(stress: &StressScenario, result: &SimulationResult) -> Option<u32> {
    if result.median_final_wealth <= 0.0 {
        return None;
    }
    Some((stress.duration_years as f64 * stress.severity.recovery_factor()).ceil() as u32)
}

/// Scores an already simulated stressed run against its baseline.
pub fn assess_stress_outcome(
    base: &Scenario,
    stress: &StressScenario,
    baseline: &SimulationResult,
    stressed: SimulationResult,
) -> StressTestResult {
    let stressed_scenario = apply_stress_parameters(base, stress);

    StressTestResult {
        scenario_id: stress.id.clone(),
        scenario_name: stress.name.clone(),
        category: stress.category,
        severity: stress.severity,
        survival_probability: stressed.success_probability,
        shortfall_risk: stressed.shortfall_risk,
        worst_case: stressed.worst_case,
        median_final_wealth: stressed.median_final_wealth,
        recovery_years: estimate_recovery_years(stress, &stressed),
        resilience_score: resilience_score(stress, &stressed, base.liquid_wealth()),
        baseline_success_probability: baseline.success_probability,
        impact: analyze_impact(base, &stressed_scenario),
        stressed,
    }
}

pub fn run_stress_test<R: Rng + ?Sized>(
    base: &Scenario,
    stress: &StressScenario,
    trial_count: usize,
    rng: &mut R,
) -> Result<StressTestResult, StressError> {
    info!(scenario = %stress.id, trials = trial_count, "running stress test");
    let baseline = run_simulation(base, trial_count, rng, None)?;
    let stressed_scenario = apply_stress_parameters(base, stress);
    let stressed = run_simulation(&stressed_scenario, trial_count, rng, None)?;

    let result = assess_stress_outcome(base, stress, &baseline, stressed);
    info!(
        scenario = %stress.id,
        survival = result.survival_probability,
        baseline = result.baseline_success_probability,
        resilience = result.resilience_score,
        "stress test finished"
    );
    Ok(result)
}

pub fn run_stress_suite<R: Rng + ?Sized>(
    base: &Scenario,
    catalog: &StressCatalog,
    trial_count: usize,
    rng: &mut R,
) -> Result<Vec<StressTestResult>, StressError> {
    catalog
        .iter()
        .map(|stress| run_stress_test(base, stress, trial_count, rng))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StressCatalog {
    scenarios: Vec<StressScenario>,
}

impl StressCatalog {
    pub fn from_json(json: &str) -> Result<Self, StressError> {
        let catalog: Self = serde_json::from_str(json)?;
        debug!(scenarios = catalog.scenarios.len(), "loaded stress catalog");
        Ok(catalog)
    }

    pub fn get(&self, id: &str) -> Result<&StressScenario, StressError> {
        self.scenarios
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| StressError::UnknownScenario(id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &StressScenario> {
        self.scenarios.iter()
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    pub fn builtin() -> Self {
        use Severity::*;
        use StressCategory::*;

        let scenarios = vec![
            StressScenario::new(
                "market-crash",
                "Market crash",
                "Sharp equity sell-off with a lasting dent in returns",
                MarketRisk,
                Severe,
                3,
                &[("portfolio_decline", 30.0), ("real_return_erosion", -1.0)],
            ),
            StressScenario::new(
                "prolonged-bear-market",
                "Prolonged bear market",
                "Years of below-trend real returns",
                MarketRisk,
                Moderate,
                5,
                &[("real_return_erosion", -2.5)],
            ),
            StressScenario::new(
                "inflation-shock",
                "Inflation shock",
                "Price spike that outruns asset returns and lifts spending",
                InflationRisk,
                Severe,
                3,
                &[
                    ("inflation_increase", 5.0),
                    ("real_return_erosion", -3.0),
                    ("expense_multiplier", 1.4),
                ],
            ),
            StressScenario::new(
                "stagflation",
                "Stagflation",
                "High inflation with weak equity and bond returns",
                InflationRisk,
                Extreme,
                5,
                &[
                    ("inflation_increase", 4.0),
                    ("equity_return_shock", -3.0),
                    ("bond_return_shock", -2.0),
                    ("expense_multiplier", 1.2),
                ],
            ),
            StressScenario::new(
                "job-loss",
                "Job loss",
                "Loss of half of earned income with a small rise in costs",
                PersonalRisk,
                Moderate,
                2,
                &[("income_reduction", 50.0), ("expense_multiplier", 1.05)],
            ),
            StressScenario::new(
                "long-term-illness",
                "Long-term illness",
                "Reduced earnings and higher care costs",
                PersonalRisk,
                Severe,
                4,
                &[("income_reduction", 60.0), ("expense_multiplier", 1.25)],
            ),
            StressScenario::new(
                "longevity",
                "Living longer",
                "Life expectancy five years beyond plan",
                LongevityRisk,
                Moderate,
                5,
                &[("longevity_increase", 5.0)],
            ),
        ];

        Self { scenarios }
    }
}

fn retained_share(percent_cut: f64) -> f64 {
    1.0 - percent_cut.clamp(0.0, 100.0) / 100.0
}

fn relative_change(base: f64, stressed: f64) -> f64 {
    if base.abs() < f64::EPSILON {
        return 0.0;
    }
    (stressed - base) / base * 100.0
}

fn expected_real_return(scenario: &Scenario) -> f64 {
    let a = &scenario.assumptions;
    scenario
        .effective_allocation()
        .weighted(a.equity_return, a.bond_return, a.cash_return, a.alternative_return)
}

fn annual_income(scenario: &Scenario) -> f64 {
    let f = &scenario.flows;
    f.income + f.other_income + f.state_pension_amount
}

fn annual_expenses(scenario: &Scenario) -> f64 {
    yearly_expenses(&scenario.flows, 1.0, scenario.balances.debts).total()
}
