pub mod error;
pub mod projection;
pub mod simulation;
pub mod stress;
pub mod types;

pub use error::{StressError, ValidationError};
pub use projection::{attach_bands, generate_projections};
pub use simulation::{
    MarketAssumptions, TrialPlan, aggregate_trials, percentile, run_simulation,
    run_simulation_async, run_trials, simulate_trial,
};
pub use stress::{
    ImpactAnalysis, Severity, StressCatalog, StressCategory, StressScenario, StressTestResult,
    analyze_impact, apply_stress_parameters, run_stress_suite, run_stress_test,
};
pub use types::{
    AccountBalances, AssetAllocation, Assumptions, Balances, ExpenseBreakdown, Flows,
    IncomeBreakdown, PercentileBands, Scenario, SimulationResult, SimulationTrial, TimeHorizon,
    YearlyProjection,
};
