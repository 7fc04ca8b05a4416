use std::sync::Arc;

use bitcoin::hashes::hex::DisplayHex;
use secp256k1::SECP256K1;

use reconquest_core::ceremony::{Clock, Coordinator, ManualClock};
use reconquest_core::chain::mock::MockChain;
use reconquest_core::chain::BlockchainAdapter;
use reconquest_core::config::{Config, Network};
use reconquest_core::crypto::LocalSigner;
use reconquest_core::escrow::{Role, TemplateKind};
use reconquest_core::keys::{self, DeriveRole};
use reconquest_core::loan::{Currency, FiatAmount, LoanTerms};
use reconquest_core::monitor::{FixedRate, RateSource};
use reconquest_core::release::{Releaser, ThreadSleeper};

/// Minimal drain so core logs show up on stderr without extra crates.
struct StderrDrain;

impl slog::Drain for StderrDrain {
    type Ok = ();
    type Err = slog::Never;

    fn log(&self, record: &slog::Record, _values: &slog::OwnedKVList) -> Result<(), slog::Never> {
        eprintln!("[{}] {}", record.level().as_short_str(), record.msg());
        Ok(())
    }
}

fn root_logger() -> slog::Logger {
    slog::Logger::root(slog::Fuse(StderrDrain), slog::o!())
}

fn parse_role(role: &str) -> DeriveRole {
    match role {
        "borrower" => DeriveRole::Borrower,
        "lender" => DeriveRole::Lender,
        _ => panic!("invalid role (must be borrower or lender): {}", role),
    }
}

fn key_derive(mut args: std::env::ArgsOs) {
    let passphrase = args
        .next()
        .expect("missing passphrase")
        .into_string()
        .expect("passphrase is not UTF-8");
    let loan_id = args
        .next()
        .expect("missing loan id")
        .into_string()
        .expect("loan id is not UTF-8")
        .parse::<u64>()
        .expect("invalid loan id");
    let user_id = args
        .next()
        .expect("missing user id")
        .into_string()
        .expect("user id is not UTF-8")
        .parse::<u64>()
        .expect("invalid user id");
    let role = args
        .next()
        .expect("missing role (borrower or lender)")
        .into_string()
        .expect("role is not UTF-8");
    let role = parse_role(&role);

    let key = keys::derive(passphrase.as_bytes(), loan_id, user_id, role, 100_000)
        .expect("derivation produced an out-of-range scalar, choose a different passphrase");
    println!("{}", key.public_key());
}

fn key_backup(mut args: std::env::ArgsOs) {
    let passphrase = args
        .next()
        .expect("missing passphrase")
        .into_string()
        .expect("passphrase is not UTF-8");
    let loan_id = args
        .next()
        .expect("missing loan id")
        .into_string()
        .expect("loan id is not UTF-8")
        .parse::<u64>()
        .expect("invalid loan id");
    let user_id = args
        .next()
        .expect("missing user id")
        .into_string()
        .expect("user id is not UTF-8")
        .parse::<u64>()
        .expect("invalid user id");
    let role = args
        .next()
        .expect("missing role (borrower or lender)")
        .into_string()
        .expect("role is not UTF-8");
    let role = parse_role(&role);

    let blob = keys::with_backup_blob(passphrase.as_bytes(), loan_id, user_id, role, 100_000)
        .expect("derivation produced an out-of-range scalar, choose a different passphrase");
    println!("{}", base64::encode(blob));
}

fn key(mut args: std::env::ArgsOs) {
    let command = args
        .next()
        .expect("missing subcommand (derive, backup)")
        .into_string()
        .expect("unrecognized command");

    match &*command {
        "derive" => key_derive(args),
        "backup" => key_backup(args),
        _ => panic!("unknown command \"{}\"", command),
    }
}

struct Demo {
    coordinator: Arc<Coordinator>,
    chain: Arc<MockChain>,
    rates: Arc<FixedRate>,
    clock: Arc<ManualClock>,
    loan: u64,
    borrower_pass: String,
}

const BORROWER_USER: u64 = 1;
const LENDER_USER: u64 = 2;

/// Drives a loan from posting through activation against the mock chain.
fn demo_activate(borrower_pass: &str, lender_pass: &str) -> Demo {
    let log = root_logger();
    let chain = Arc::new(MockChain::new(Network::Testnet, log.clone()));
    // 25 000 EUR per bitcoin
    let rates = Arc::new(FixedRate::new(2_500_000));
    let clock = Arc::new(ManualClock::new(1_700_000_000));
    let platform = Arc::new(LocalSigner::random());
    let coordinator = Arc::new(Coordinator::new(
        Config::testnet(),
        chain.clone() as Arc<dyn BlockchainAdapter>,
        rates.clone() as Arc<dyn RateSource>,
        platform,
        clock.clone() as Arc<dyn Clock>,
        log,
    ));

    let terms = LoanTerms {
        principal: FiatAmount { cents: 100_000, currency: Currency::Eur },
        annual_rate_bps: 500,
        term_months: 3,
        collateral: bitcoin::Amount::from_sat(2_500_000),
    };
    let loan = coordinator.post_loan(BORROWER_USER, terms);
    println!("posted loan {} for {} over {} months", loan, terms.principal, terms.term_months);
    coordinator.commit_lender(loan, LENDER_USER).expect("lender commit failed");

    let borrower_key = keys::derive(borrower_pass.as_bytes(), loan, BORROWER_USER, DeriveRole::Borrower, 100_000)
        .expect("borrower derivation failed");
    let lender_key = keys::derive(lender_pass.as_bytes(), loan, LENDER_USER, DeriveRole::Lender, 100_000)
        .expect("lender derivation failed");
    coordinator
        .register_key(loan, Role::Borrower, &borrower_key.public_key().to_string())
        .expect("borrower key rejected");
    coordinator
        .register_key(loan, Role::Lender, &lender_key.public_key().to_string())
        .expect("lender key rejected");
    coordinator.register_platform_key(loan).expect("platform key rejected");

    let borrower_payout = fresh_address();
    let lender_payout = fresh_address();
    coordinator
        .register_payout(loan, Role::Borrower, &borrower_payout)
        .expect("borrower payout rejected");
    coordinator
        .register_payout(loan, Role::Lender, &lender_payout)
        .expect("lender payout rejected");

    let (address, witness_script) = coordinator.derive_address(loan).expect("address derivation failed");
    println!("escrow address: {}", address);
    println!("witness script: {}", witness_script.as_bytes().to_lower_hex_string());

    let funding = chain.fund_address(&address, terms.collateral);
    coordinator.declare_funding(loan, funding, 0).expect("funding declaration failed");
    chain.mine(2);
    assert!(coordinator.confirm_funding(loan).expect("funding confirmation failed"));
    println!("funding {} confirmed with 3 confirmations", funding);

    for (kind, role, user_key) in [
        (TemplateKind::Repayment, Role::Borrower, &borrower_key),
        (TemplateKind::Default, Role::Borrower, &borrower_key),
        (TemplateKind::Recovery, Role::Borrower, &borrower_key),
        (TemplateKind::Liquidation, Role::Lender, &lender_key),
    ] {
        let template = coordinator.template(loan, kind).expect("template missing");
        let signature = user_key.sign(&template.sighash);
        let wire = reconquest_core::crypto::serialize_with_hashtype(&signature);
        coordinator
            .submit_signature(loan, kind, role, &user_key.public_key().to_string(), &wire.to_lower_hex_string())
            .expect("signature rejected");
        println!("{} signed {}", role, kind);
    }
    println!("ceremony complete, loan active");

    Demo {
        coordinator,
        chain,
        rates,
        clock,
        loan,
        borrower_pass: borrower_pass.to_string(),
    }
}

fn fresh_address() -> String {
    let key = secp256k1::SecretKey::new(&mut secp256k1::rand::thread_rng());
    let pubkey = bitcoin::CompressedPublicKey(secp256k1::PublicKey::from_secret_key(SECP256K1, &key));
    bitcoin::Address::p2wpkh(&pubkey, bitcoin::Network::Testnet).to_string()
}

fn releaser_for(demo: &Demo) -> Releaser {
    Releaser::new(
        Arc::clone(&demo.coordinator),
        demo.coordinator.config().broadcast_retry,
        Arc::new(ThreadSleeper),
        demo.coordinator.logger(),
    )
}

fn print_trail(demo: &Demo) {
    println!();
    println!("audit trail:");
    for entry in demo.coordinator.audit().entries_for(demo.loan) {
        println!("  #{} {} {}", entry.id, entry.kind.as_str(), entry.outcome);
    }
}

fn demo_happy() {
    let demo = demo_activate("correct horse battery", "satoshi staple");
    let coordinator = &demo.coordinator;

    coordinator.declare_fiat_confirmed(demo.loan).expect("fiat confirmation failed");
    coordinator.declare_repaid(demo.loan, Role::Borrower).expect("repayment declaration failed");
    println!("outcome: {:?}", coordinator.trigger_outcome(demo.loan).expect("outcome failed"));

    let result = releaser_for(&demo).release(demo.loan).expect("release failed");
    println!("release result: {:?}", result);
    print_trail(&demo);
}

fn demo_default() {
    let demo = demo_activate("correct horse battery", "satoshi staple");
    let coordinator = &demo.coordinator;

    // keep the collateral value healthy so the overdue rule, not the LTV
    // rule, decides
    demo.rates.set(8_100_000);
    demo.clock.advance(95 * 86_400);
    println!("due date passed with no repayment");
    println!("outcome: {:?}", coordinator.trigger_outcome(demo.loan).expect("outcome failed"));

    let result = releaser_for(&demo).release(demo.loan).expect("release failed");
    println!("release result: {:?}", result);
    print_trail(&demo);
}

fn demo_recovery() {
    let demo = demo_activate("correct horse battery", "satoshi staple");
    let coordinator = &demo.coordinator;

    let expiry = coordinator
        .store()
        .snapshot(demo.loan)
        .expect("loan vanished")
        .timelock_expiry_block
        .expect("no timelock");
    let tip = demo.chain.tip_height().expect("tip unavailable");
    demo.chain.mine(expiry - tip + 1);
    println!("timelock expired at block {}", expiry);

    let txid = coordinator
        .request_recovery(demo.loan, demo.borrower_pass.as_bytes())
        .expect("recovery failed");
    println!("recovery broadcast: {}", txid);
    print_trail(&demo);
}

fn demo(mut args: std::env::ArgsOs) {
    let command = args
        .next()
        .expect("missing subcommand (happy, default, recovery)")
        .into_string()
        .expect("unrecognized command");

    match &*command {
        "happy" => demo_happy(),
        "default" => demo_default(),
        "recovery" => demo_recovery(),
        _ => panic!("unknown command \"{}\"", command),
    }
}

fn main() {
    let mut args = std::env::args_os();
    let _program_name = args.next().expect("missing program name");
    let command = args
        .next()
        .expect("missing subcommand (key, demo)")
        .into_string()
        .expect("unrecognized command");

    match &*command {
        "key" => key(args),
        "demo" => demo(args),
        _ => panic!("unknown command \"{}\"", command),
    }
}
