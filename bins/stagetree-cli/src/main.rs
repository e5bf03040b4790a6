//! stagetree-cli: command-line client for a Stagetree node.
//!
//! Wraps the node's JSON-RPC methods and adds an offline `simulate` command
//! that projects stage economics for a reward profile.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use jsonrpsee::core::client::ClientT;
use jsonrpsee::core::params::ArrayParams;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use serde_json::value::RawValue;
use stagetree_core::constants::{Amount, DEFAULT_RPC_PORT, MAX_STAGE, UNIT};
use stagetree_core::profile::RewardProfile;
use stagetree_core::simulation::{project_stages, Projection};

/// Stagetree command-line client.
#[derive(Parser)]
#[command(name = "stagetree-cli")]
#[command(version, about = "Client for the Stagetree placement engine")]
struct Cli {
    /// RPC endpoint URL.
    #[arg(short, long, global = true, default_value_t = default_endpoint())]
    rpc_endpoint: String,

    #[command(subcommand)]
    command: Commands,
}

fn default_endpoint() -> String {
    format!("http://127.0.0.1:{DEFAULT_RPC_PORT}")
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a confirmed purchase unit.
    Purchase(PurchaseArgs),
    /// Place one unit at a stage's own price.
    Place(PlaceArgs),
    /// List an owner's positions.
    Positions(OwnerArgs),
    /// Show the completion-bonus tranches of a position.
    Tranches(PositionArgs),
    /// Release a position's pending company-side payout to the treasury.
    Release(PositionArgs),
    /// Show an owner's balance.
    Balance(OwnerArgs),
    /// Time-lock part of an owner's balance.
    Lock(LockArgs),
    /// Withdrawal subcommands.
    Withdrawal {
        #[command(subcommand)]
        action: WithdrawalAction,
    },
    /// Show node info.
    Info,
    /// Project stage economics offline. Does not contact the node.
    Simulate(SimulateArgs),
}

#[derive(Subcommand)]
enum WithdrawalAction {
    /// Request a withdrawal; debits the balance immediately.
    Request(WithdrawalRequestArgs),
    /// Route a pending withdrawal to its rail.
    Execute(WithdrawalIdArgs),
    /// Mark a withdrawal as paid.
    Complete(WithdrawalCompleteArgs),
    /// Fail a withdrawal and refund the owner.
    Fail(WithdrawalFailArgs),
}

#[derive(Args)]
struct PurchaseArgs {
    #[arg(short, long)]
    owner: u64,

    #[arg(short, long, default_value_t = 1)]
    stage: u32,

    /// Unit base price in tokens (e.g. 1000 or 12.5).
    #[arg(short, long, default_value = "1000")]
    price: String,

    /// Idempotency key of the confirmed order unit.
    #[arg(short, long)]
    key: String,
}

#[derive(Args)]
struct PlaceArgs {
    #[arg(short, long)]
    owner: u64,

    #[arg(short, long)]
    stage: u32,
}

#[derive(Args)]
struct OwnerArgs {
    #[arg(short, long)]
    owner: u64,
}

#[derive(Args)]
struct PositionArgs {
    #[arg(short, long)]
    position: u64,
}

#[derive(Args)]
struct LockArgs {
    #[arg(short, long)]
    owner: u64,

    /// Amount in tokens.
    #[arg(short, long)]
    amount: String,
}

#[derive(Args)]
struct WithdrawalRequestArgs {
    #[arg(short, long)]
    owner: u64,

    /// Amount in tokens.
    #[arg(short, long)]
    amount: String,

    /// "bank" or "token".
    #[arg(short, long)]
    method: String,

    /// Bank account reference or token address.
    #[arg(short, long)]
    destination: String,
}

#[derive(Args)]
struct WithdrawalIdArgs {
    #[arg(long)]
    id: u64,
}

#[derive(Args)]
struct WithdrawalCompleteArgs {
    #[arg(long)]
    id: u64,

    /// External payment reference.
    #[arg(long)]
    reference: Option<String>,
}

#[derive(Args)]
struct WithdrawalFailArgs {
    #[arg(long)]
    id: u64,

    #[arg(long)]
    reason: String,
}

#[derive(Args)]
struct SimulateArgs {
    /// Built-in reward profile name.
    #[arg(short, long, default_value = "principal-sixty-two")]
    profile: String,

    /// Stage-1 slot price in tokens.
    #[arg(long, default_value = "1000")]
    stage_one_price: String,

    /// Number of stages to project.
    #[arg(short, long, default_value_t = MAX_STAGE)]
    stages: u32,

    /// Print the projection as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let endpoint = cli.rpc_endpoint;

    match cli.command {
        Commands::Simulate(args) => simulate(args),
        Commands::Purchase(args) => {
            let mut params = ArrayParams::new();
            params.insert(args.owner)?;
            params.insert(args.stage)?;
            params.insert(parse_tokens(&args.price)?)?;
            params.insert(args.key)?;
            call(&endpoint, "submitpurchase", params).await
        }
        Commands::Place(args) => {
            let mut params = ArrayParams::new();
            params.insert(args.owner)?;
            params.insert(args.stage)?;
            call(&endpoint, "placeunit", params).await
        }
        Commands::Positions(args) => call(&endpoint, "querypositions", single(args.owner)?).await,
        Commands::Tranches(args) => call(&endpoint, "tranchereport", single(args.position)?).await,
        Commands::Release(args) => {
            let client = connect(&endpoint)?;
            let released: Amount = client
                .request("releasependingpayout", single(args.position)?)
                .await
                .context("RPC releasependingpayout failed")?;
            println!("Released: {} to treasury", format_tokens(released));
            Ok(())
        }
        Commands::Balance(args) => {
            let client = connect(&endpoint)?;
            let balance: Amount = client
                .request("getbalance", single(args.owner)?)
                .await
                .context("RPC getbalance failed")?;
            println!("Owner {}: {} ({} minor units)", args.owner, format_tokens(balance), balance);
            Ok(())
        }
        Commands::Lock(args) => {
            let mut params = ArrayParams::new();
            params.insert(args.owner)?;
            params.insert(parse_tokens(&args.amount)?)?;
            call(&endpoint, "lockdeposit", params).await
        }
        Commands::Withdrawal { action } => withdrawal(&endpoint, action).await,
        Commands::Info => call(&endpoint, "getinfo", ArrayParams::new()).await,
    }
}

async fn withdrawal(endpoint: &str, action: WithdrawalAction) -> Result<()> {
    match action {
        WithdrawalAction::Request(args) => {
            let mut params = ArrayParams::new();
            params.insert(args.owner)?;
            params.insert(parse_tokens(&args.amount)?)?;
            params.insert(args.method)?;
            params.insert(args.destination)?;
            call(endpoint, "requestwithdrawal", params).await
        }
        WithdrawalAction::Execute(args) => call(endpoint, "executewithdrawal", single(args.id)?).await,
        WithdrawalAction::Complete(args) => {
            let mut params = ArrayParams::new();
            params.insert(args.id)?;
            params.insert(args.reference)?;
            call(endpoint, "completewithdrawal", params).await
        }
        WithdrawalAction::Fail(args) => {
            let mut params = ArrayParams::new();
            params.insert(args.id)?;
            params.insert(args.reason)?;
            call(endpoint, "failwithdrawal", params).await
        }
    }
}

fn connect(endpoint: &str) -> Result<HttpClient> {
    HttpClientBuilder::default()
        .build(endpoint)
        .with_context(|| format!("Failed to connect to RPC at {endpoint}"))
}

fn single(value: u64) -> Result<ArrayParams> {
    let mut params = ArrayParams::new();
    params.insert(value)?;
    Ok(params)
}

/// Call `method` and print the JSON result as received.
///
/// Kept raw: `serde_json::Value` would round amounts above `u64::MAX`
/// through `f64`.
async fn call(endpoint: &str, method: &str, params: ArrayParams) -> Result<()> {
    let client = connect(endpoint)?;
    let value: Box<RawValue> = client
        .request(method, params)
        .await
        .with_context(|| format!("RPC {method} failed"))?;
    println!("{}", value.get());
    Ok(())
}

fn simulate(args: SimulateArgs) -> Result<()> {
    let profile = RewardProfile::named(&args.profile)
        .with_context(|| format!("unknown profile {:?}", args.profile))?;
    profile.validate().context("profile failed validation")?;
    let projection = project_stages(&profile, parse_tokens(&args.stage_one_price)?, args.stages)
        .context("stage amounts overflow")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&projection)?);
    } else {
        print_projection(&projection);
    }
    Ok(())
}

fn print_projection(projection: &Projection) {
    println!("Profile: {}", projection.profile);
    println!(
        "{:>5}  {:>22}  {:>20}  {:>22}  {:>22}  {:>22}",
        "stage", "slot price", "MC/leg", "MC total", "NSP total", "company side"
    );
    for s in &projection.stages {
        println!(
            "{:>5}{} {:>22}  {:>20}  {:>22}  {:>22}  {:>22}",
            s.stage,
            if s.pegged { "*" } else { " " },
            format_tokens(s.slot_price),
            format_tokens(s.mc_per_leg),
            format_tokens(s.mc_total),
            format_tokens(s.nsp_total),
            format_tokens(s.company_side_total),
        );
    }
    let t = &projection.totals;
    println!();
    println!("Legs:          {}", t.legs);
    println!("Inflow:        {}", format_tokens(t.inflow));
    println!("MC paid:       {}", format_tokens(t.mc_paid));
    println!("JB paid:       {}", format_tokens(t.jb_paid));
    println!("Company side:  {}", format_tokens(t.company_side));
    println!("Margin:        {}", format_tokens(t.margin));
    if projection.stages.iter().any(|s| s.pegged) {
        println!("(* pegged stage)");
    }
}

/// Parse a decimal token amount ("1000", "12.5") into minor units exactly.
fn parse_tokens(s: &str) -> Result<Amount> {
    let s = s.trim();
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        bail!("empty amount");
    }
    if frac.len() > 8 {
        bail!("amount {s:?} has more than 8 decimal places");
    }
    let whole: Amount = if whole.is_empty() {
        0
    } else {
        whole.parse().with_context(|| format!("invalid amount {s:?}"))?
    };
    let frac_units: Amount = if frac.is_empty() {
        0
    } else {
        let digits: Amount = frac.parse().with_context(|| format!("invalid amount {s:?}"))?;
        digits * (10 as Amount).pow(8 - frac.len() as u32)
    };
    whole
        .checked_mul(UNIT)
        .and_then(|w| w.checked_add(frac_units))
        .with_context(|| format!("amount {s:?} overflows"))
}

fn format_tokens(amount: Amount) -> String {
    format!("{}.{:08}", amount / UNIT, amount % UNIT)
}
