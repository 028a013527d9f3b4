use serde::{Deserialize, Serialize};

use super::error::ValidationError;

const ALLOCATION_TOLERANCE: f64 = 0.01;
const RISK_SCORE_CASH_WEIGHT: f64 = 5.0;

pub const MAX_AGE: u32 = 130;
pub const MAX_PROJECTION_YEARS: u32 = 150;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeHorizon {
    pub current_age: u32,
    pub retirement_age: u32,
    pub life_expectancy: u32,
    pub projection_years: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Balances {
    pub cash_savings: f64,
    pub investment_portfolio: f64,
    pub pension_pot: f64,
    pub property: f64,
    pub debts: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Flows {
    /// Employment income, received until retirement age.
    pub income: f64,
    pub other_income: f64,
    pub state_pension_amount: f64,
    pub state_pension_age: u32,
    /// Paid from income into the pension pot before retirement.
    pub contributions: f64,
    pub essential_expenses: f64,
    pub lifestyle_expenses: f64,
    pub discretionary_expenses: f64,
    pub total_expenses: f64,
    pub mortgage_payment: f64,
    /// Declared ongoing drawdown taken from the pension pot every year.
    pub pension_drawdown: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AssetAllocation {
    pub equity: f64,
    pub bond: f64,
    pub cash: f64,
    pub alternative: f64,
}

impl AssetAllocation {
    pub fn total(&self) -> f64 {
        self.equity + self.bond + self.cash + self.alternative
    }

    /// Default allocation for a 1-10 risk score. Cash is pinned at 5%, equity
    /// climbs linearly from 10% to 90% and bonds take the remainder.
    pub fn from_risk_score(risk_score: u8) -> Self {
        let score = f64::from(risk_score.clamp(1, 10));
        let equity = 10.0 + (score - 1.0) * 80.0 / 9.0;
        Self {
            equity,
            bond: 100.0 - RISK_SCORE_CASH_WEIGHT - equity,
            cash: RISK_SCORE_CASH_WEIGHT,
            alternative: 0.0,
        }
    }

    pub(crate) fn weighted(&self, equity: f64, bond: f64, cash: f64, alternative: f64) -> f64 {
        (self.equity * equity + self.bond * bond + self.cash * cash + self.alternative * alternative)
            / 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Assumptions {
    pub inflation_rate: f64,
    pub equity_return: f64,
    pub bond_return: f64,
    pub cash_return: f64,
    pub alternative_return: f64,
    pub allocation: Option<AssetAllocation>,
    pub risk_score: u8,
}

impl Default for Assumptions {
    fn default() -> Self {
        Self {
            inflation_rate: 0.0,
            equity_return: 0.0,
            bond_return: 0.0,
            cash_return: 0.0,
            alternative_return: 0.0,
            allocation: None,
            risk_score: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Scenario {
    pub time: TimeHorizon,
    pub balances: Balances,
    pub flows: Flows,
    pub assumptions: Assumptions,
}

impl Scenario {
    pub fn liquid_wealth(&self) -> f64 {
        self.balances.cash_savings + self.balances.investment_portfolio + self.balances.pension_pot
    }

    pub fn net_worth(&self) -> f64 {
        self.liquid_wealth() + self.balances.property - self.balances.debts
    }

    /// The allocation the stochastic engine runs with: the declared one, or
    /// one derived from the risk score.
    pub fn effective_allocation(&self) -> AssetAllocation {
        self.assumptions
            .allocation
            .unwrap_or_else(|| AssetAllocation::from_risk_score(self.assumptions.risk_score))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let time = &self.time;
        if time.current_age > MAX_AGE {
            return Err(ValidationError::new(
                "time.currentAge",
                format!("must be <= {MAX_AGE}"),
            ));
        }
        if time.retirement_age < time.current_age {
            return Err(ValidationError::new(
                "time.retirementAge",
                "must be >= currentAge",
            ));
        }
        if time.life_expectancy < time.retirement_age {
            return Err(ValidationError::new(
                "time.lifeExpectancy",
                "must be >= retirementAge",
            ));
        }
        if time.life_expectancy > MAX_AGE {
            return Err(ValidationError::new(
                "time.lifeExpectancy",
                format!("must be <= {MAX_AGE}"),
            ));
        }
        if time.projection_years == 0 {
            return Err(ValidationError::new("time.projectionYears", "must be >= 1"));
        }
        if time.projection_years > MAX_PROJECTION_YEARS {
            return Err(ValidationError::new(
                "time.projectionYears",
                format!("must be <= {MAX_PROJECTION_YEARS}"),
            ));
        }

        for (field, value) in [
            ("balances.cashSavings", self.balances.cash_savings),
            ("balances.investmentPortfolio", self.balances.investment_portfolio),
            ("balances.pensionPot", self.balances.pension_pot),
            ("balances.property", self.balances.property),
            ("balances.debts", self.balances.debts),
            ("flows.income", self.flows.income),
            ("flows.otherIncome", self.flows.other_income),
            ("flows.statePensionAmount", self.flows.state_pension_amount),
            ("flows.contributions", self.flows.contributions),
            ("flows.essentialExpenses", self.flows.essential_expenses),
            ("flows.lifestyleExpenses", self.flows.lifestyle_expenses),
            ("flows.discretionaryExpenses", self.flows.discretionary_expenses),
            ("flows.totalExpenses", self.flows.total_expenses),
            ("flows.mortgagePayment", self.flows.mortgage_payment),
            ("flows.pensionDrawdown", self.flows.pension_drawdown),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ValidationError::new(field, "must be a finite value >= 0"));
            }
        }

        let assumptions = &self.assumptions;
        if !assumptions.inflation_rate.is_finite() || assumptions.inflation_rate <= -100.0 {
            return Err(ValidationError::new(
                "assumptions.inflationRate",
                "must be > -100",
            ));
        }
        for (field, value) in [
            ("assumptions.equityReturn", assumptions.equity_return),
            ("assumptions.bondReturn", assumptions.bond_return),
            ("assumptions.cashReturn", assumptions.cash_return),
            ("assumptions.alternativeReturn", assumptions.alternative_return),
        ] {
            if !value.is_finite() || value <= -100.0 {
                return Err(ValidationError::new(field, "must be > -100"));
            }
        }
        if !(1..=10).contains(&assumptions.risk_score) {
            return Err(ValidationError::new(
                "assumptions.riskScore",
                "must be between 1 and 10",
            ));
        }

        if let Some(allocation) = &assumptions.allocation {
            for (field, weight) in [
                ("assumptions.allocation.equity", allocation.equity),
                ("assumptions.allocation.bond", allocation.bond),
                ("assumptions.allocation.cash", allocation.cash),
                ("assumptions.allocation.alternative", allocation.alternative),
            ] {
                if !weight.is_finite() || weight < 0.0 {
                    return Err(ValidationError::new(field, "must be >= 0"));
                }
            }
            if (allocation.total() - 100.0).abs() > ALLOCATION_TOLERANCE {
                return Err(ValidationError::new(
                    "assumptions.allocation",
                    format!("must sum to 100, got {}", allocation.total()),
                ));
            }
        }

        Ok(())
    }
}

/// Closing percentile bands for one projection year, taken across trials.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileBands {
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountBalances {
    pub cash_savings: f64,
    pub investment_portfolio: f64,
    pub pension_pot: f64,
    pub property: f64,
    pub debts: f64,
}

impl AccountBalances {
    pub fn liquid_total(&self) -> f64 {
        self.cash_savings + self.investment_portfolio + self.pension_pot
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomeBreakdown {
    pub employment: f64,
    pub other: f64,
    pub state_pension: f64,
    pub pension_drawdown: f64,
    /// Draws from cash savings and the investment portfolio.
    pub investment_drawdown: f64,
}

impl IncomeBreakdown {
    pub fn total(&self) -> f64 {
        self.employment
            + self.other
            + self.state_pension
            + self.pension_drawdown
            + self.investment_drawdown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseBreakdown {
    pub essential: f64,
    pub lifestyle: f64,
    pub discretionary: f64,
    pub mortgage: f64,
}

impl ExpenseBreakdown {
    pub fn total(&self) -> f64 {
        self.essential + self.lifestyle + self.discretionary + self.mortgage
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearlyProjection {
    pub year: u32,
    pub age: u32,
    pub opening: AccountBalances,
    pub closing: AccountBalances,
    pub income: IncomeBreakdown,
    pub expenses: ExpenseBreakdown,
    /// Expenses the waterfall could not fund once every account was empty.
    pub shortfall: f64,
    pub total_wealth: f64,
    pub percentiles: Option<PercentileBands>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationTrial {
    pub yearly_wealth: Vec<f64>,
    pub final_wealth: f64,
    pub success: bool,
    pub max_drawdown: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub trial_count: usize,
    pub success_probability: f64,
    pub shortfall_risk: f64,
    pub average_final_wealth: f64,
    pub median_final_wealth: f64,
    pub percentiles: PercentileBands,
    pub max_final_wealth: f64,
    pub worst_case: f64,
    pub max_drawdown: f64,
    pub yearly_bands: Vec<PercentileBands>,
    pub execution_time_ms: f64,
}
