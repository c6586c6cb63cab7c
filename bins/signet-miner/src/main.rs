//! signet-miner: produce blocks for a signature-gated test network.
//!
//! Subcommands build signing envelopes from templates, finalize signed
//! envelopes into blocks, run the scheduled production loop against a node,
//! and calibrate difficulty for a proof-of-work solver.

use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::ScriptBuf;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use signet_core::constants::{DEFAULT_TARGET_SPACING, MIN_NBITS};
use signet_core::template::BlockTemplate;
use signet_miner::calibrate::{calibrate, CalibrationGoal};
use signet_miner::commitment::ExtensionSignal;
use signet_miner::config::{default_cookie_path, MinerConfig, RpcAuth, RpcConfig, SchedulerConfig};
use signet_miner::envelope::Envelope;
use signet_miner::finalize::SolverChoice;
use signet_miner::generator::{create_envelope, solve_envelope, Generator};
use signet_miner::rpc::{BitcoindRpc, NodeRpc};
use signet_miner::scheduler::MultiMinerPartition;

/// Signet block producer.
#[derive(Debug, Parser)]
#[command(name = "signet-miner")]
#[command(version, about = "Block producer for signature-gated proof-of-work test networks")]
struct Cli {
    #[command(flatten)]
    rpc: RpcArgs,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Read a getblocktemplate reply on stdin and print an unsigned envelope.
    Genpsbt(GenpsbtArgs),
    /// Read a signed envelope on stdin and print the finished block hex.
    Solvepsbt(SolveArgs),
    /// Run the scheduled block production loop.
    Generate(GenerateArgs),
    /// Measure solver speed and suggest a difficulty.
    Calibrate(CalibrateArgs),
}

#[derive(Debug, Args)]
struct RpcArgs {
    /// Node JSON-RPC endpoint.
    #[arg(long, global = true, default_value = "http://127.0.0.1:38332")]
    rpc_url: String,

    /// RPC user name (requires --rpc-password).
    #[arg(long, global = true, requires = "rpc_password")]
    rpc_user: Option<String>,

    /// RPC password.
    #[arg(long, global = true, requires = "rpc_user")]
    rpc_password: Option<String>,

    /// RPC cookie file (default: ~/.bitcoin/signet/.cookie).
    #[arg(long, global = true, conflicts_with = "rpc_user")]
    rpc_cookie: Option<PathBuf>,
}

impl RpcArgs {
    fn config(&self) -> RpcConfig {
        let auth = match (&self.rpc_user, &self.rpc_password, &self.rpc_cookie) {
            (Some(user), Some(password), _) => RpcAuth::UserPass {
                user: user.clone(),
                password: password.clone(),
            },
            (_, _, Some(path)) => RpcAuth::CookieFile(path.clone()),
            _ => default_cookie_path().map_or(RpcAuth::None, RpcAuth::CookieFile),
        };
        RpcConfig {
            url: self.rpc_url.clone(),
            auth,
            ..RpcConfig::default()
        }
    }
}

#[derive(Debug, Args)]
struct RewardArgs {
    /// Coinbase payout script as hex.
    #[arg(long, conflicts_with = "address")]
    reward_script: Option<String>,

    /// Wallet address to pay the coinbase to (resolved via the node).
    #[arg(long)]
    address: Option<String>,

    /// Identifier pushed after the height in the coinbase scriptSig.
    #[arg(long)]
    pool_id: Option<String>,
}

impl RewardArgs {
    async fn script(&self, rpc: &RpcArgs) -> Result<ScriptBuf> {
        match (&self.reward_script, &self.address) {
            (Some(script), _) => hex::decode(script.trim())
                .map(ScriptBuf::from_bytes)
                .context("invalid --reward-script hex"),
            (None, Some(address)) => {
                let node = BitcoindRpc::new(&rpc.config())?;
                node.address_script(address)
                    .await
                    .with_context(|| format!("resolving address {address}"))
            }
            (None, None) => bail!("one of --reward-script or --address is required"),
        }
    }

    fn pool_id(&self) -> Option<Vec<u8>> {
        self.pool_id.as_ref().map(|id| id.as_bytes().to_vec())
    }
}

#[derive(Debug, Args)]
struct SignalArgs {
    /// Version bit whose presence adds the signal marker to the signed digest.
    #[arg(long, default_value_t = 28)]
    signal_bit: u8,

    /// Four-byte signal marker as hex.
    #[arg(long, default_value = "01000000", value_parser = parse_marker)]
    signal_marker: [u8; 4],
}

impl SignalArgs {
    fn signal(&self) -> ExtensionSignal {
        ExtensionSignal {
            version_bit: self.signal_bit,
            marker: self.signal_marker,
        }
    }
}

#[derive(Debug, Args)]
struct GenpsbtArgs {
    #[command(flatten)]
    reward: RewardArgs,

    #[command(flatten)]
    signal: SignalArgs,

    /// Block timestamp (default: the template's curtime).
    #[arg(long)]
    block_time: Option<u32>,
}

#[derive(Debug, Args)]
struct SolveArgs {
    /// External grinder command; brute force when absent.
    #[arg(long)]
    grind_cmd: Option<String>,
}

#[derive(Debug, Args)]
struct GenerateArgs {
    #[command(flatten)]
    reward: RewardArgs,

    #[command(flatten)]
    signal: SignalArgs,

    /// External grinder command; brute force when absent.
    #[arg(long)]
    grind_cmd: Option<String>,

    /// Stop after this many blocks.
    #[arg(long)]
    max_blocks: Option<u64>,

    /// Target compact difficulty as hex.
    #[arg(long, value_parser = parse_nbits, conflicts_with = "min_nbits", required_unless_present = "min_nbits")]
    nbits: Option<u32>,

    /// Target the minimum signet difficulty.
    #[arg(long)]
    min_nbits: bool,

    /// Nominal block spacing in seconds.
    #[arg(long, default_value_t = DEFAULT_TARGET_SPACING)]
    target_spacing: f64,

    /// Randomize intervals with an exponential distribution.
    #[arg(long)]
    poisson: bool,

    /// Longest interval between blocks in seconds.
    #[arg(long, default_value_t = 1800.0)]
    max_interval: f64,

    /// Seconds to delay every block.
    #[arg(long, default_value_t = 0)]
    standby_delay: i64,

    /// Seconds to delay blocks owned by other miners.
    #[arg(long, default_value_t = 0)]
    backup_delay: i64,

    /// Mine a single block with this timestamp.
    #[arg(long)]
    set_block_time: Option<i64>,

    /// Responsibility share, as k/n or k-l/n.
    #[arg(long)]
    multiminer: Option<MultiMinerPartition>,
}

#[derive(Debug, Args)]
struct CalibrateArgs {
    /// Report the average solve time at this compact difficulty.
    #[arg(long, value_parser = parse_nbits, conflicts_with = "seconds")]
    nbits: Option<u32>,

    /// Find the difficulty giving this average solve time.
    #[arg(long)]
    seconds: Option<f64>,

    /// External grinder command; brute force when absent.
    #[arg(long)]
    grind_cmd: Option<String>,
}

fn parse_nbits(s: &str) -> Result<u32, String> {
    if s.len() != 8 {
        return Err(format!("expected 8 hex digits, got {s:?}"));
    }
    u32::from_str_radix(s, 16).map_err(|e| e.to_string())
}

fn parse_marker(s: &str) -> Result<[u8; 4], String> {
    let bytes = hex::decode(s).map_err(|e| e.to_string())?;
    bytes
        .try_into()
        .map_err(|_| format!("expected 4 bytes, got {s:?}"))
}

fn read_stdin() -> Result<String> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("reading stdin")?;
    Ok(input)
}

fn solver_choice(grind_cmd: Option<&str>) -> Result<SolverChoice> {
    SolverChoice::from_grind_cmd(grind_cmd).context("invalid --grind-cmd")
}

async fn genpsbt(rpc: &RpcArgs, args: GenpsbtArgs) -> Result<()> {
    let template = BlockTemplate::from_json_str(&read_stdin()?).context("parsing block template")?;
    let reward_script = args.reward.script(rpc).await?;
    let pool_id = args.reward.pool_id();
    let envelope = create_envelope(
        &template,
        &reward_script,
        args.block_time,
        pool_id.as_deref(),
        &args.signal.signal(),
    )?;
    println!("{}", envelope.to_base64());
    Ok(())
}

async fn solvepsbt(args: SolveArgs) -> Result<()> {
    let envelope = Envelope::from_base64(&read_stdin()?).context("decoding envelope")?;
    let solver = solver_choice(args.grind_cmd.as_deref())?.into_solver();
    let block = tokio::task::spawn_blocking(move || solve_envelope(&envelope, solver.as_ref()))
        .await
        .context("solver task failed")??;
    println!("{}", serialize_hex(&block));
    Ok(())
}

async fn generate(rpc: &RpcArgs, args: GenerateArgs) -> Result<()> {
    let ultimate_bits = match (args.nbits, args.min_nbits) {
        (Some(bits), false) => bits,
        (None, true) => MIN_NBITS,
        _ => bail!("exactly one of --nbits or --min-nbits is required"),
    };

    let mut config = MinerConfig::new(args.reward.script(rpc).await?);
    config.pool_id = args.reward.pool_id();
    config.solver = solver_choice(args.grind_cmd.as_deref())?;
    config.max_blocks = args.max_blocks;
    config.rpc = rpc.config();
    config.signal = args.signal.signal();
    config.scheduler = SchedulerConfig {
        target_spacing: args.target_spacing,
        ultimate_bits,
        poisson: args.poisson,
        max_interval: args.max_interval,
        standby_delay: args.standby_delay,
        backup_delay: args.backup_delay,
        set_block_time: args.set_block_time,
        partition: args.multiminer.unwrap_or_default(),
    };
    config.validate()?;

    info!(
        rpc = %config.rpc.url,
        nbits = %format!("{ultimate_bits:08x}"),
        partition = %config.scheduler.partition,
        "starting block production"
    );

    let node: Arc<dyn NodeRpc> = Arc::new(BitcoindRpc::new(&config.rpc)?);
    let max_blocks = config.effective_max_blocks();
    let generator = Generator::new(node, config)?;

    let running = generator.running_flag();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        warn!("received SIGINT, shutting down...");
        running.store(false, Ordering::Relaxed);
    });

    let mined = generator
        .run(max_blocks)
        .await
        .context("block production failed")?;
    info!(mined, "done");
    Ok(())
}

async fn run_calibrate(args: CalibrateArgs) -> Result<()> {
    let goal = match (args.nbits, args.seconds) {
        (Some(bits), None) => CalibrationGoal::Nbits(bits),
        (None, Some(secs)) => CalibrationGoal::Seconds(secs),
        (None, None) => CalibrationGoal::default(),
        (Some(_), Some(_)) => bail!("only one of --nbits and --seconds may be given"),
    };
    let solver = solver_choice(args.grind_cmd.as_deref())?.into_solver();
    let calibration = tokio::task::spawn_blocking(move || calibrate(solver.as_ref(), goal))
        .await
        .context("calibration task failed")??;
    println!("{calibration}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    match cli.command {
        Commands::Genpsbt(args) => genpsbt(&cli.rpc, args).await,
        Commands::Solvepsbt(args) => solvepsbt(args).await,
        Commands::Generate(args) => generate(&cli.rpc, args).await,
        Commands::Calibrate(args) => run_calibrate(args).await,
    }
}
