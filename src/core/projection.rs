use super::types::{
    AccountBalances, Assumptions, ExpenseBreakdown, Flows, IncomeBreakdown, Scenario,
    SimulationResult, YearlyProjection,
};

const ESSENTIAL_SHARE: f64 = 0.60;
const LIFESTYLE_SHARE: f64 = 0.25;
const DISCRETIONARY_SHARE: f64 = 0.15;

#[derive(Debug, Clone, Copy)]
struct Accounts {
    cash: f64,
    investments: f64,
    pension: f64,
    property: f64,
    debts: f64,
}

impl Accounts {
    fn from_scenario(scenario: &Scenario) -> Self {
        let b = &scenario.balances;
        Self {
            cash: b.cash_savings,
            investments: b.investment_portfolio,
            pension: b.pension_pot,
            property: b.property,
            debts: b.debts,
        }
    }

    fn snapshot(&self) -> AccountBalances {
        AccountBalances {
            cash_savings: self.cash.max(0.0),
            investment_portfolio: self.investments.max(0.0),
            pension_pot: self.pension.max(0.0),
            property: self.property.max(0.0),
            debts: self.debts.max(0.0),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Account {
    Cash,
    Investments,
    Pension,
}

const WATERFALL: [Account; 3] = [Account::Cash, Account::Investments, Account::Pension];

/// Runs the deterministic year-by-year projection for `scenario`.
///
/// One row per projection year; a zero-year horizon yields a single row
/// describing the opening position. Rows keep coming after every account is
/// exhausted, with the unfunded spending reported as `shortfall`.
pub fn generate_projections(scenario: &Scenario) -> Vec<YearlyProjection> {
    let mut accounts = Accounts::from_scenario(scenario);

    if scenario.time.projection_years == 0 {
        let opening = accounts.snapshot();
        return vec![YearlyProjection {
            year: 0,
            age: scenario.time.current_age,
            opening,
            closing: opening,
            income: IncomeBreakdown::default(),
            expenses: ExpenseBreakdown::default(),
            shortfall: 0.0,
            total_wealth: opening.liquid_total(),
            percentiles: None,
        }];
    }

    let growth = nominal_portfolio_return(&scenario.assumptions);
    let inflation = scenario.assumptions.inflation_rate / 100.0;
    let mut rows = Vec::with_capacity(scenario.time.projection_years as usize);

    for year in 1..=scenario.time.projection_years {
        let age = scenario.time.current_age.saturating_add(year - 1);
        let price_index = inflation_index(inflation, year);
        let opening = accounts.snapshot();

        let expenses = yearly_expenses(&scenario.flows, price_index, accounts.debts);
        let mut income = non_portfolio_income(scenario, age, price_index);
        let contribution = yearly_contribution(scenario, age, price_index);

        accounts.pension += contribution;
        accounts.pension *= 1.0 + growth;
        accounts.investments *= 1.0 + growth;
        accounts.debts = (accounts.debts - expenses.mortgage).max(0.0);

        let declared = scenario.flows.pension_drawdown.min(accounts.pension.max(0.0));
        accounts.pension -= declared;
        income.pension_drawdown += declared;

        let available = income.employment + income.other + income.state_pension + declared
            - contribution;
        let deficit = expenses.total() - available;

        let mut shortfall = 0.0;
        if deficit > 0.0 {
            shortfall = run_waterfall(deficit, &mut accounts, &mut income);
        } else {
            accounts.cash += -deficit;
        }

        let closing = accounts.snapshot();
        rows.push(YearlyProjection {
            year,
            age,
            opening,
            closing,
            income,
            expenses,
            shortfall,
            total_wealth: closing.liquid_total(),
            percentiles: None,
        });
    }

    rows
}

/// Copies per-year percentile bands from a stochastic run onto the matching
/// deterministic rows. Rows beyond the simulated horizon are left untouched.
pub fn attach_bands(projections: &mut [YearlyProjection], result: &SimulationResult) {
    for row in projections.iter_mut() {
        if row.year == 0 {
            continue;
        }
        if let Some(bands) = result.yearly_bands.get(row.year as usize - 1) {
            row.percentiles = Some(*bands);
        }
    }
}

/// Draws `deficit` from cash, then investments, then pension. Each account
/// must be empty before the next is touched. Returns what is left unfunded.
fn run_waterfall(deficit: f64, accounts: &mut Accounts, income: &mut IncomeBreakdown) -> f64 {
    let mut remaining = deficit;

    for account in WATERFALL {
        if remaining <= 0.0 {
            break;
        }

        let balance = match account {
            Account::Cash => &mut accounts.cash,
            Account::Investments => &mut accounts.investments,
            Account::Pension => &mut accounts.pension,
        };
        let drawn = balance.max(0.0).min(remaining);
        *balance -= drawn;
        remaining -= drawn;

        match account {
            Account::Cash | Account::Investments => income.investment_drawdown += drawn,
            Account::Pension => income.pension_drawdown += drawn,
        }
    }

    remaining.max(0.0)
}

pub(crate) fn inflation_index(inflation: f64, year: u32) -> f64 {
    (1.0 + inflation).powi(year.saturating_sub(1) as i32)
}

pub(crate) fn nominal_portfolio_return(assumptions: &Assumptions) -> f64 {
    let allocation = assumptions.allocation.unwrap_or_default();
    let inflation = assumptions.inflation_rate / 100.0;
    let nominal = |real: f64| (1.0 + real / 100.0) * (1.0 + inflation) - 1.0;
    allocation.weighted(
        nominal(assumptions.equity_return),
        nominal(assumptions.bond_return),
        nominal(assumptions.cash_return),
        nominal(assumptions.alternative_return),
    )
}

pub(crate) fn yearly_expenses(flows: &Flows, price_index: f64, debts: f64) -> ExpenseBreakdown {
    let has_breakdown = flows.essential_expenses > 0.0
        || flows.lifestyle_expenses > 0.0
        || flows.discretionary_expenses > 0.0;

    let (essential, lifestyle, discretionary) = if has_breakdown {
        (
            flows.essential_expenses,
            flows.lifestyle_expenses,
            flows.discretionary_expenses,
        )
    } else {
        (
            flows.total_expenses * ESSENTIAL_SHARE,
            flows.total_expenses * LIFESTYLE_SHARE,
            flows.total_expenses * DISCRETIONARY_SHARE,
        )
    };

    ExpenseBreakdown {
        essential: essential * price_index,
        lifestyle: lifestyle * price_index,
        discretionary: discretionary * price_index,
        mortgage: flows.mortgage_payment.min(debts.max(0.0)),
    }
}

pub(crate) fn non_portfolio_income(scenario: &Scenario, age: u32, price_index: f64) -> IncomeBreakdown {
    let flows = &scenario.flows;
    let employment = if age < scenario.time.retirement_age {
        flows.income * price_index
    } else {
        0.0
    };
    let state_pension = if age >= flows.state_pension_age {
        flows.state_pension_amount * price_index
    } else {
        0.0
    };

    IncomeBreakdown {
        employment,
        other: flows.other_income * price_index,
        state_pension,
        ..IncomeBreakdown::default()
    }
}

pub(crate) fn yearly_contribution(scenario: &Scenario, age: u32, price_index: f64) -> f64 {
    if age < scenario.time.retirement_age {
        scenario.flows.contributions * price_index
    } else {
        0.0
    }
}
