use std::time::{Duration, Instant};

use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use super::error::ValidationError;
use super::projection::{inflation_index, non_portfolio_income, yearly_expenses};
use super::types::{AssetAllocation, PercentileBands, Scenario, SimulationResult, SimulationTrial};

/// Trials between two progress checkpoints.
pub const PROGRESS_INTERVAL: usize = 100;

const RETURN_FLOOR: f64 = -0.95;
const RETURN_CAP: f64 = 2.5;
const DEFAULT_EQUITY_VOLATILITY: f64 = 18.0;
const DEFAULT_BOND_VOLATILITY: f64 = 6.0;

/// Return-generating assumptions for the stochastic engine, in percent.
/// Means are real returns; the engine adds `inflation` before sampling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MarketAssumptions {
    pub equity_mean: f64,
    pub equity_volatility: f64,
    pub bond_mean: f64,
    pub bond_volatility: f64,
    pub cash_return: f64,
    pub alternative_return: f64,
    pub inflation: f64,
}

impl Default for MarketAssumptions {
    fn default() -> Self {
        Self {
            equity_mean: 5.0,
            equity_volatility: DEFAULT_EQUITY_VOLATILITY,
            bond_mean: 2.0,
            bond_volatility: DEFAULT_BOND_VOLATILITY,
            cash_return: 0.5,
            alternative_return: 0.0,
            inflation: 2.5,
        }
    }
}

impl MarketAssumptions {
    pub fn for_scenario(scenario: &Scenario) -> Self {
        let a = &scenario.assumptions;
        Self {
            equity_mean: a.equity_return,
            equity_volatility: DEFAULT_EQUITY_VOLATILITY,
            bond_mean: a.bond_return,
            bond_volatility: DEFAULT_BOND_VOLATILITY,
            cash_return: a.cash_return,
            alternative_return: a.alternative_return,
            inflation: a.inflation_rate,
        }
    }
}

/// Everything a single trial needs, precomputed once per run: pooled starting
/// wealth, the net withdrawal for every year and the return model.
#[derive(Debug, Clone)]
pub struct TrialPlan {
    start_wealth: f64,
    withdrawals: Vec<f64>,
    allocation: AssetAllocation,
    equity_mean: f64,
    equity_vol: f64,
    bond_mean: f64,
    bond_vol: f64,
    cash_return: f64,
    alternative_return: f64,
}

impl TrialPlan {
    pub fn new(scenario: &Scenario, market: &MarketAssumptions, allocation: AssetAllocation) -> Self {
        let inflation = market.inflation / 100.0;
        let nominal = |real: f64| (1.0 + real / 100.0) * (1.0 + inflation) - 1.0;

        let mut debts = scenario.balances.debts;
        let withdrawals = (1..=scenario.time.projection_years)
            .map(|year| {
                let age = scenario.time.current_age.saturating_add(year - 1);
                let price_index = inflation_index(inflation, year);
                let expenses = yearly_expenses(&scenario.flows, price_index, debts);
                debts = (debts - expenses.mortgage).max(0.0);
                let income = non_portfolio_income(scenario, age, price_index);
                expenses.total() - (income.employment + income.other + income.state_pension)
            })
            .collect();

        Self {
            start_wealth: scenario.liquid_wealth(),
            withdrawals,
            allocation,
            equity_mean: nominal(market.equity_mean),
            equity_vol: market.equity_volatility / 100.0,
            bond_mean: nominal(market.bond_mean),
            bond_vol: market.bond_volatility / 100.0,
            cash_return: nominal(market.cash_return),
            alternative_return: nominal(market.alternative_return),
        }
    }

    pub fn years(&self) -> usize {
        self.withdrawals.len()
    }

    fn sample_return<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let z_equity: f64 = StandardNormal.sample(rng);
        let z_bond: f64 = StandardNormal.sample(rng);
        let equity = (self.equity_mean + self.equity_vol * z_equity).clamp(RETURN_FLOOR, RETURN_CAP);
        let bond = (self.bond_mean + self.bond_vol * z_bond).clamp(RETURN_FLOOR, RETURN_CAP);
        self.allocation
            .weighted(equity, bond, self.cash_return, self.alternative_return)
    }
}

pub fn simulate_trial<R: Rng + ?Sized>(plan: &TrialPlan, rng: &mut R) -> SimulationTrial {
    let mut wealth = plan.start_wealth;
    let mut peak = wealth.max(0.0);
    let mut max_drawdown: f64 = 0.0;
    let mut failed = false;
    let mut yearly_wealth = Vec::with_capacity(plan.years());

    for withdrawal in &plan.withdrawals {
        if failed {
            yearly_wealth.push(0.0);
            continue;
        }

        wealth = wealth * (1.0 + plan.sample_return(rng)) - withdrawal;
        if wealth <= 0.0 {
            failed = true;
            wealth = 0.0;
            if peak > 0.0 {
                max_drawdown = 100.0;
            }
            yearly_wealth.push(0.0);
            continue;
        }

        peak = peak.max(wealth);
        if peak > 0.0 {
            max_drawdown = max_drawdown.max((peak - wealth) / peak * 100.0);
        }
        yearly_wealth.push(wealth);
    }

    SimulationTrial {
        yearly_wealth,
        final_wealth: if failed { 0.0 } else { wealth },
        success: !failed,
        max_drawdown,
    }
}

/// Runs `trial_count` independent trials, reporting completion percentage
/// every [`PROGRESS_INTERVAL`] trials and once more at the end.
pub fn run_trials<R, F>(
    plan: &TrialPlan,
    trial_count: usize,
    rng: &mut R,
    mut on_progress: F,
) -> Vec<SimulationTrial>
where
    R: Rng + ?Sized,
    F: FnMut(u8),
{
    let mut trials = Vec::with_capacity(trial_count);
    for done in 1..=trial_count {
        trials.push(simulate_trial(plan, rng));
        if is_checkpoint(done, trial_count) {
            on_progress(progress_percent(done, trial_count));
        }
    }
    trials
}

pub fn run_simulation<R: Rng + ?Sized>(
    scenario: &Scenario,
    trial_count: usize,
    rng: &mut R,
    on_progress: Option<&mut dyn FnMut(u8)>,
) -> Result<SimulationResult, ValidationError> {
    scenario.validate()?;
    let started = Instant::now();
    let plan = TrialPlan::new(
        scenario,
        &MarketAssumptions::for_scenario(scenario),
        scenario.effective_allocation(),
    );

    let trials = match on_progress {
        Some(callback) => run_trials(&plan, trial_count, rng, callback),
        None => run_trials(&plan, trial_count, rng, |_| {}),
    };
    Ok(aggregate_trials(&trials, started.elapsed()))
}

/// Same as [`run_simulation`], but hands control back to the runtime at every
/// progress checkpoint so long runs do not starve other tasks.
pub async fn run_simulation_async<R: Rng + ?Sized>(
    scenario: &Scenario,
    trial_count: usize,
    rng: &mut R,
    mut on_progress: Option<&mut (dyn FnMut(u8) + Send)>,
) -> Result<SimulationResult, ValidationError> {
    scenario.validate()?;
    let started = Instant::now();
    let plan = TrialPlan::new(
        scenario,
        &MarketAssumptions::for_scenario(scenario),
        scenario.effective_allocation(),
    );

    let mut trials = Vec::with_capacity(trial_count);
    for done in 1..=trial_count {
        trials.push(simulate_trial(&plan, rng));
        if is_checkpoint(done, trial_count) {
            if let Some(callback) = on_progress.as_deref_mut() {
                callback(progress_percent(done, trial_count));
            }
            tokio::task::yield_now().await;
        }
    }

    Ok(aggregate_trials(&trials, started.elapsed()))
}

pub fn aggregate_trials(trials: &[SimulationTrial], elapsed: Duration) -> SimulationResult {
    let execution_time_ms = elapsed.as_secs_f64() * 1000.0;
    if trials.is_empty() {
        return SimulationResult {
            trial_count: 0,
            success_probability: 0.0,
            shortfall_risk: 100.0,
            average_final_wealth: 0.0,
            median_final_wealth: 0.0,
            percentiles: PercentileBands::default(),
            max_final_wealth: 0.0,
            worst_case: 0.0,
            max_drawdown: 0.0,
            yearly_bands: Vec::new(),
            execution_time_ms,
        };
    }

    let n = trials.len();
    let successes = trials.iter().filter(|t| t.success).count();
    let success_probability = successes as f64 / n as f64 * 100.0;

    let mut finals = trials.iter().map(|t| t.final_wealth).collect::<Vec<_>>();
    finals.sort_by(|a, b| a.total_cmp(b));

    let years = trials.iter().map(|t| t.yearly_wealth.len()).max().unwrap_or(0);
    let yearly_bands = (0..years)
        .map(|idx| {
            let mut values = trials
                .iter()
                .filter_map(|t| t.yearly_wealth.get(idx).copied())
                .collect::<Vec<_>>();
            values.sort_by(|a, b| a.total_cmp(b));
            bands(&values)
        })
        .collect();

    SimulationResult {
        trial_count: n,
        success_probability,
        shortfall_risk: 100.0 - success_probability,
        average_final_wealth: finals.iter().sum::<f64>() / n as f64,
        median_final_wealth: percentile(&finals, 50.0),
        percentiles: bands(&finals),
        max_final_wealth: finals[n - 1],
        worst_case: finals[0],
        max_drawdown: trials.iter().map(|t| t.max_drawdown).fold(0.0, f64::max),
        yearly_bands,
        execution_time_ms,
    }
}

/// Value at index `floor((n - 1) * p / 100)` of an ascending slice; 0 when empty.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 100.0) / 100.0).floor() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn bands(sorted: &[f64]) -> PercentileBands {
    PercentileBands {
        p10: percentile(sorted, 10.0),
        p25: percentile(sorted, 25.0),
        p50: percentile(sorted, 50.0),
        p75: percentile(sorted, 75.0),
        p90: percentile(sorted, 90.0),
    }
}

fn is_checkpoint(done: usize, total: usize) -> bool {
    done % PROGRESS_INTERVAL == 0 || done == total
}

fn progress_percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    (done * 100 / total).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::fixtures::retiree_scenario;
    use crate::core::types::{Balances, Flows, TimeHorizon};
    use proptest::prelude::{prop_assert, proptest};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn calm_market() -> MarketAssumptions {
        MarketAssumptions {
            equity_mean: 0.0,
            equity_volatility: 0.0,
            bond_mean: 0.0,
            bond_volatility: 0.0,
            cash_return: 0.0,
            alternative_return: 0.0,
            inflation: 0.0,
        }
    }

    fn pooled_scenario(wealth: f64, need: f64, years: u32) -> Scenario {
        Scenario {
            time: TimeHorizon {
                current_age: 70,
                retirement_age: 70,
                life_expectancy: 95,
                projection_years: years,
            },
            balances: Balances {
                pension_pot: wealth,
                ..Balances::default()
            },
            flows: Flows {
                total_expenses: need,
                state_pension_age: 200,
                ..Flows::default()
            },
            ..Scenario::default()
        }
    }

    fn trial_with_final(final_wealth: f64) -> SimulationTrial {
        SimulationTrial {
            yearly_wealth: vec![final_wealth.max(0.0)],
            final_wealth,
            success: final_wealth > 0.0,
            max_drawdown: 0.0,
        }
    }

    #[test]
    fn calm_market_trial_matches_straight_line_drawdown() {
        let scenario = pooled_scenario(100_000.0, 4_000.0, 5);
        let plan = TrialPlan::new(&scenario, &calm_market(), AssetAllocation::from_risk_score(5));
        let mut rng = StdRng::seed_from_u64(1);

        let trial = simulate_trial(&plan, &mut rng);
        assert!(trial.success);
        assert_approx(trial.final_wealth, 80_000.0);
        assert_eq!(trial.yearly_wealth.len(), 5);
        assert_approx(trial.yearly_wealth[0], 96_000.0);
        assert_approx(trial.max_drawdown, 20.0);
    }

    #[test]
    fn failed_trial_stops_advancing_and_reports_zero() {
        let scenario = pooled_scenario(10_000.0, 4_000.0, 5);
        let plan = TrialPlan::new(&scenario, &calm_market(), AssetAllocation::from_risk_score(5));
        let mut rng = StdRng::seed_from_u64(2);

        let trial = simulate_trial(&plan, &mut rng);
        assert!(!trial.success);
        assert_eq!(trial.final_wealth, 0.0);
        for (actual, expected) in trial.yearly_wealth.iter().zip([6_000.0, 2_000.0, 0.0, 0.0, 0.0]) {
            assert_approx(*actual, expected);
        }
        assert_approx(trial.max_drawdown, 100.0);
    }

    #[test]
    fn inflation_raises_later_withdrawals() {
        let scenario = pooled_scenario(100_000.0, 10_000.0, 2);
        let market = MarketAssumptions {
            inflation: 10.0,
            ..calm_market()
        };
        let plan = TrialPlan::new(&scenario, &market, AssetAllocation::default());
        assert_approx(plan.withdrawals[0], 10_000.0);
        assert_approx(plan.withdrawals[1], 11_000.0);
    }

    #[test]
    fn income_offsets_withdrawals_and_surplus_is_saved() {
        let mut scenario = pooled_scenario(0.0, 10_000.0, 1);
        scenario.flows.other_income = 12_000.0;
        let plan = TrialPlan::new(&scenario, &calm_market(), AssetAllocation::default());
        assert_approx(plan.withdrawals[0], -2_000.0);

        let trial = simulate_trial(&plan, &mut StdRng::seed_from_u64(3));
        assert!(trial.success);
        assert_approx(trial.final_wealth, 2_000.0);
    }

    #[test]
    fn percentile_uses_floor_index() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&sorted, 50.0), 2.0);
        assert_eq!(percentile(&sorted, 90.0), 3.0);
        assert_eq!(percentile(&sorted, 100.0), 4.0);
        assert_eq!(percentile(&sorted, 0.0), 1.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn empty_trial_set_aggregates_to_defaults() {
        let result = aggregate_trials(&[], Duration::ZERO);
        assert_eq!(result.trial_count, 0);
        assert_eq!(result.success_probability, 0.0);
        assert_eq!(result.shortfall_risk, 100.0);
        assert_eq!(result.worst_case, 0.0);
        assert!(result.yearly_bands.is_empty());
    }

    #[test]
    fn aggregate_reports_symmetric_trial_set() {
        let trials = [-100.0, -100.0, 100.0, 100.0].map(trial_with_final);
        let result = aggregate_trials(&trials, Duration::ZERO);

        assert_approx(result.success_probability, 50.0);
        assert_approx(result.shortfall_risk, 50.0);
        assert_approx(result.average_final_wealth, 0.0);
        assert_approx(result.worst_case, -100.0);
        assert_approx(result.max_final_wealth, 100.0);
        assert_approx(result.percentiles.p10, -100.0);
        assert_approx(result.percentiles.p90, 100.0);
    }

    #[test]
    fn run_simulation_reports_progress_at_checkpoints() {
        let scenario = retiree_scenario();
        let mut rng = StdRng::seed_from_u64(11);
        let mut seen = Vec::new();
        let mut record = |p: u8| seen.push(p);

        let result = run_simulation(&scenario, 250, &mut rng, Some(&mut record)).expect("valid");
        assert_eq!(result.trial_count, 250);
        assert_eq!(seen, vec![40, 80, 100]);
    }

    #[test]
    fn run_simulation_rejects_invalid_scenario() {
        let mut scenario = retiree_scenario();
        scenario.time.projection_years = 0;
        let mut rng = StdRng::seed_from_u64(5);
        let err = run_simulation(&scenario, 10, &mut rng, None).expect_err("zero horizon");
        assert_eq!(err.field, "time.projectionYears");

        let mut scenario = retiree_scenario();
        scenario.time.current_age = u32::MAX;
        scenario.time.retirement_age = u32::MAX;
        scenario.time.life_expectancy = u32::MAX;
        scenario.time.projection_years = 4_000_000_000;
        let err = run_simulation(&scenario, 10, &mut rng, None).expect_err("ages past limit");
        assert_eq!(err.field, "time.currentAge");
    }

    #[test]
    fn trial_plan_saturates_ages_near_the_integer_limit() {
        let mut scenario = retiree_scenario();
        scenario.time.current_age = u32::MAX - 1;
        scenario.time.retirement_age = u32::MAX;
        scenario.time.life_expectancy = u32::MAX;
        scenario.time.projection_years = 3;

        let plan = TrialPlan::new(
            &scenario,
            &MarketAssumptions::for_scenario(&scenario),
            scenario.effective_allocation(),
        );
        assert_eq!(plan.years(), 3);
    }

    #[test]
    fn run_simulation_statistics_are_ordered() {
        let scenario = retiree_scenario();
        let mut rng = StdRng::seed_from_u64(42);
        let result = run_simulation(&scenario, 1_000, &mut rng, None).expect("valid");

        assert_approx(result.success_probability + result.shortfall_risk, 100.0);
        let p = result.percentiles;
        assert!(result.worst_case <= p.p10);
        assert!(p.p10 <= p.p25 && p.p25 <= p.p50 && p.p50 <= p.p75 && p.p75 <= p.p90);
        assert!(p.p90 <= result.max_final_wealth);
        assert_eq!(result.median_final_wealth, p.p50);
        assert!((0.0..=100.0).contains(&result.max_drawdown));
        assert_eq!(result.yearly_bands.len(), 25);
    }

    #[test]
    fn higher_risk_score_widens_outcome_spread() {
        let mut cautious = retiree_scenario();
        cautious.assumptions.allocation = None;
        cautious.assumptions.risk_score = 1;
        let mut adventurous = cautious.clone();
        adventurous.assumptions.risk_score = 10;

        let narrow = run_simulation(&cautious, 2_000, &mut StdRng::seed_from_u64(9), None)
            .expect("valid");
        let wide = run_simulation(&adventurous, 2_000, &mut StdRng::seed_from_u64(9), None)
            .expect("valid");

        let spread = |r: &SimulationResult| r.percentiles.p90 - r.percentiles.p10;
        assert!(spread(&wide) > spread(&narrow));
    }

    #[tokio::test]
    async fn async_run_matches_sync_run_for_same_seed() {
        let scenario = retiree_scenario();
        let sync_result =
            run_simulation(&scenario, 300, &mut StdRng::seed_from_u64(77), None).expect("valid");

        let mut seen = Vec::new();
        let mut record = |p: u8| seen.push(p);
        let async_result = run_simulation_async(
            &scenario,
            300,
            &mut StdRng::seed_from_u64(77),
            Some(&mut record),
        )
        .await
        .expect("valid");

        assert_eq!(seen, vec![33, 66, 100]);
        assert_eq!(sync_result.percentiles, async_result.percentiles);
        assert_eq!(sync_result.success_probability, async_result.success_probability);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(64))]

        #[test]
        fn prop_aggregate_invariants_hold(finals in proptest::collection::vec(-1_000_000i64..5_000_000, 1..200)) {
            let trials = finals.iter().map(|v| trial_with_final(*v as f64)).collect::<Vec<_>>();
            let result = aggregate_trials(&trials, Duration::ZERO);
            let p = result.percentiles;

            prop_assert!((result.success_probability + result.shortfall_risk - 100.0).abs() < 1e-9);
            prop_assert!(result.worst_case <= p.p10);
            prop_assert!(p.p10 <= p.p25);
            prop_assert!(p.p25 <= p.p50);
            prop_assert!(p.p50 <= p.p75);
            prop_assert!(p.p75 <= p.p90);
            prop_assert!(p.p90 <= result.max_final_wealth);
        }
    }
}
