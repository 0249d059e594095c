// tests/integration.rs
//
// End-to-end flows over a realistic two-bank market: fetch-shaped snapshots
// in, summary and previews out, with the generation-token gate in between.

use fixed::types::I80F48;
use percolend::*;
use solana_program::pubkey::Pubkey;

const NOW: i64 = 1_700_000_000;

fn fx(v: f64) -> I80F48 {
    I80F48::from_num(v)
}

fn assert_close(actual: I80F48, expected: I80F48) {
    let diff = (actual - expected).abs();
    assert!(
        diff < fx(1e-6),
        "expected {} near {}, diff {}",
        actual,
        expected,
        diff
    );
}

fn rate_config() -> InterestRateConfig {
    InterestRateConfig {
        optimal_utilization_rate: fx(0.8),
        plateau_interest_rate: fx(0.1),
        max_interest_rate: fx(3.0),
        insurance_fee_fixed_apr: fx(0.0),
        insurance_ir_fee: fx(0.025),
        protocol_fixed_fee_apr: fx(0.0),
        protocol_ir_fee: fx(0.05),
        protocol_origination_fee: fx(0.0),
    }
}

/// SOL-like bank: 9 decimals, $10 oracle.
fn sol_bank() -> Bank {
    Bank {
        address: Pubkey::new_unique(),
        mint: Pubkey::new_unique(),
        mint_decimals: 9,
        config: BankConfig {
            asset_weight_init: fx(0.8),
            asset_weight_maint: fx(0.9),
            liability_weight_init: fx(1.25),
            liability_weight_maint: fx(1.1),
            deposit_limit: 0,
            borrow_limit: 0,
            total_asset_value_init_limit: 0,
            risk_tier: RiskTier::Collateral,
            operational_state: OperationalState::Operational,
            oracle_max_age: 60,
            asset_tag: AssetTag::Sol,
            interest_rate_config: rate_config(),
        },
        total_asset_shares: fx(10_000e9),
        total_liability_shares: fx(2_000e9),
        total_deposits: fx(10_000e9),
        total_borrows: fx(2_000e9),
    }
}

/// USDC-like bank: 6 decimals, $1 oracle.
fn usdc_bank() -> Bank {
    Bank {
        address: Pubkey::new_unique(),
        mint: Pubkey::new_unique(),
        mint_decimals: 6,
        config: BankConfig {
            asset_weight_init: fx(0.9),
            asset_weight_maint: fx(0.95),
            liability_weight_init: fx(1.1),
            liability_weight_maint: fx(1.05),
            deposit_limit: 0,
            borrow_limit: 0,
            total_asset_value_init_limit: 0,
            risk_tier: RiskTier::Collateral,
            operational_state: OperationalState::Operational,
            oracle_max_age: 60,
            asset_tag: AssetTag::Default,
            interest_rate_config: rate_config(),
        },
        total_asset_shares: fx(500_000e6),
        total_liability_shares: fx(200_000e6),
        total_deposits: fx(500_000e6),
        total_borrows: fx(200_000e6),
    }
}

fn market() -> (Bank, Bank, MarketSnapshot) {
    let sol = sol_bank();
    let usdc = usdc_bank();
    let prices = vec![
        (
            sol.address,
            OraclePriceSnapshot::new(fx(10.0), fx(0.01), NOW).unwrap(),
        ),
        (
            usdc.address,
            OraclePriceSnapshot::new(fx(1.0), fx(0.0005), NOW).unwrap(),
        ),
    ];
    let snap = MarketSnapshot::new(vec![sol.clone(), usdc.clone()], prices, NOW).unwrap();
    (sol, usdc, snap)
}

fn lender_account(sol: &Bank) -> MarginAccount {
    MarginAccount {
        address: Pubkey::new_unique(),
        authority: Pubkey::new_unique(),
        balances: vec![Balance {
            bank: sol.address,
            asset_shares: fx(50e9), // 50 SOL
            liability_shares: I80F48::ZERO,
            active: true,
            last_update: NOW,
        }],
    }
}

#[test]
fn summary_then_borrow_preview_flow() {
    let (sol, usdc, snap) = market();
    let acct = lender_account(&sol);

    let summary = compute_account_summary(&acct, &snap, NOW).unwrap();
    assert_close(summary.lending_amount, fx(500.0)); // 50 SOL * $10
    assert_eq!(summary.borrowing_amount, I80F48::ZERO);
    assert_eq!(summary.health_factor, I80F48::ONE);
    assert!(summary.free_collateral > I80F48::ZERO);

    // borrow 100 USDC against it
    let req = ActionRequest::new(ActionType::Borrow, usdc.address, fx(100e6));
    let outcome = simulate_action(&acct, &snap, &req, NOW).unwrap();
    assert!(outcome.messages.is_empty());
    let preview = outcome.preview.unwrap();
    assert_close(preview.position_amount, fx(100.0));
    assert!(preview.health > I80F48::ZERO && preview.health < I80F48::ONE);
    assert!(preview.liquidation_price.is_some());

    // the mutated clone, not the input, carries the new debt
    assert!(acct.balance(&usdc.address).is_none());
    assert!(outcome.account.balance(&usdc.address).is_some());

    // rates on the simulated pool moved with the extra borrow
    let rates = compute_interest_rates(snap.bank(&usdc.address).unwrap()).unwrap();
    assert_close(rates.utilization, fx(0.4));
}

#[test]
fn rapid_input_keeps_only_the_latest_simulation() {
    let (sol, usdc, snap) = market();
    let acct = lender_account(&sol);
    let mut gate: SimulationGate<ActionOutcome> = SimulationGate::new();

    // three keystrokes in quick succession: 10, 20, 30 USDC
    let amounts = [fx(10e6), fx(20e6), fx(30e6)];
    let tokens: Vec<_> = amounts.iter().map(|_| gate.issue()).collect();
    let outcomes: Vec<_> = amounts
        .iter()
        .map(|amount| {
            let req = ActionRequest::new(ActionType::Borrow, usdc.address, *amount);
            simulate_action(&acct, &snap, &req, NOW).unwrap()
        })
        .collect();

    // responses come back out of order: 2nd, 3rd, then the stale 1st
    assert!(!gate.commit(tokens[1], outcomes[1].clone()));
    assert!(gate.commit(tokens[2], outcomes[2].clone()));
    assert!(!gate.commit(tokens[0], outcomes[0].clone()));

    let kept = gate.latest().unwrap().preview.as_ref().unwrap();
    assert_close(kept.position_amount, fx(30.0));
}

#[test]
fn loop_preview_and_intents() {
    let (sol, usdc, snap) = market();
    let acct = lender_account(&sol);

    let mut req = ActionRequest::new(ActionType::Loop, sol.address, fx(10e9));
    req.secondary_bank = Some(usdc.address);
    req.secondary_amount = Some(fx(80e6));
    let outcome = simulate_action(&acct, &snap, &req, NOW).unwrap();
    assert!(outcome.messages.is_empty());
    let preview = outcome.preview.unwrap();
    assert_close(preview.position_amount, fx(60.0)); // 50 + 10 SOL

    // intents for the transaction builder: deposit leg then borrow leg
    let intents = action_intents(&req);
    assert_eq!(intents.len(), 2);
    assert!(matches!(
        intents[0],
        ActionIntent::Deposit { bank, .. } if bank == sol.address
    ));
    assert!(matches!(
        intents[1],
        ActionIntent::Borrow { bank, .. } if bank == usdc.address
    ));

    // leverage bound for this pair: ltv = 0.8 / 1.1
    let lev = max_leverage(&sol, &usdc).unwrap();
    assert!(lev > fx(3.0) && lev < fx(4.0));
}

#[test]
fn authoritative_simulation_preview() {
    let (sol, usdc, snap) = market();
    let acct = lender_account(&sol);

    // run the local preview first
    let req = ActionRequest::new(ActionType::Borrow, usdc.address, fx(100e6));
    let outcome = simulate_action(&acct, &snap, &req, NOW).unwrap();

    // the execution collaborator returns post-state balances and pools;
    // here it agrees exactly with the local clone
    let post_banks = vec![
        snap.bank(&sol.address).unwrap().clone(),
        outcome
            .account
            .balance(&usdc.address)
            .map(|_| {
                let mut b = snap.bank(&usdc.address).unwrap().clone();
                b.total_borrows += fx(100e6);
                b.total_liability_shares += fx(100e6);
                b
            })
            .unwrap(),
    ];
    let sim = ExecutionSimulation {
        account: outcome.account.clone(),
        banks: post_banks,
    };
    let authoritative = simulated_action_preview(&sim, &usdc.address, &snap, NOW).unwrap();

    assert_close(authoritative.position_amount, fx(100.0));
    assert!(authoritative.health > I80F48::ZERO);
    assert!(authoritative.borrow_rate > authoritative.deposit_rate);
    assert!(authoritative.available_collateral.amount > I80F48::ZERO);
    assert!(
        authoritative.available_collateral.ratio > I80F48::ZERO
            && authoritative.available_collateral.ratio <= I80F48::ONE
    );
}

#[test]
fn protocol_stats_over_market() {
    let (_, _, snap) = market();
    let stats = compute_protocol_stats(&snap).unwrap();
    // 10_000 SOL * $10 + 500_000 USDC = 600_000 deposits
    assert_close(stats.deposits, fx(600_000.0));
    // 2_000 SOL * $10 + 200_000 USDC = 220_000 borrows
    assert_close(stats.borrows, fx(220_000.0));
    assert_close(stats.tvl, fx(380_000.0));
}
