use clap::{Args, Parser, Subcommand};

use prefill_cli::config::RunConfig;
use prefill_cli::logging;
use prefill_cli::run::{self, tolerance};

#[derive(Parser)]
#[command(
    name = "prefill",
    about = "Unpadded causal context attention with paged KV cache writes"
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one synthetic prefill and verify it against the f64 reference
    Run(RunArgs),
    /// Inspect or persist the run configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show(RunArgs),
    /// Write the effective configuration to the config file
    Save(RunArgs),
}

/// Every flag is optional; unset flags fall back to the config file, then
/// to built-in defaults.
#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Number of sequences in the packed batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Token slots per cache block
    #[arg(long)]
    block_size: Option<usize>,

    /// Blocks reserved per sequence (block table width)
    #[arg(long)]
    max_blocks_per_seq: Option<usize>,

    /// Query heads
    #[arg(long)]
    num_heads: Option<usize>,

    /// Query heads per kv head
    #[arg(long)]
    kv_group_num: Option<usize>,

    #[arg(long)]
    head_dim: Option<usize>,

    /// Give every sequence the full table capacity
    #[arg(long)]
    same_context: Option<bool>,

    #[arg(long)]
    seed: Option<u64>,

    /// f32, f16 or bf16
    #[arg(long)]
    dtype: Option<String>,

    /// Cache layout: hdn, nhd or hnd
    #[arg(long)]
    layout: Option<String>,

    /// Attention backend: naive or tiled
    #[arg(long)]
    backend: Option<String>,

    /// Query positions per unit of work in the tiled backend
    #[arg(long)]
    query_tile: Option<usize>,
}

impl RunArgs {
    fn into_config(self) -> RunConfig {
        RunConfig {
            batch_size: self.batch_size,
            block_size: self.block_size,
            max_blocks_per_seq: self.max_blocks_per_seq,
            num_heads: self.num_heads,
            kv_group_num: self.kv_group_num,
            head_dim: self.head_dim,
            same_context: self.same_context,
            seed: self.seed,
            dtype: self.dtype,
            layout: self.layout,
            backend: self.backend,
            query_tile: self.query_tile,
        }
    }
}

/// File config overridden by CLI flags.
fn effective_config(args: RunArgs) -> RunConfig {
    let mut config = RunConfig::load();
    config.merge(&args.into_config());
    config
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_with_level(&cli.log_level)?;

    match cli.command {
        Command::Run(args) => {
            let settings = effective_config(args).resolve()?;
            let report = run::execute(&settings)?;
            let (atol, rtol) = tolerance(settings.dtype);

            println!("backend:          {}", report.backend);
            println!("context lengths:  {:?}", report.context_lengths);
            println!("output shape:     {:?}", report.output_dims);
            println!(
                "cache:            {} tokens in {} blocks ({} occupied)",
                report.tokens_written, report.blocks_written, report.occupied_blocks
            );
            println!("max |diff|:       {:.3e}", report.max_abs_diff);
            println!("elapsed:          {:.2?}", report.elapsed);

            if !report.within_tolerance {
                anyhow::bail!(
                    "output differs from reference beyond atol={atol:e}, rtol={rtol:e} \
                     (max |diff| {:.3e})",
                    report.max_abs_diff
                );
            }
            println!("result:           ok (atol={atol:e}, rtol={rtol:e})");
        }
        Command::Config { action } => match action {
            ConfigAction::Show(args) => {
                let config = effective_config(args);
                config.resolve()?;
                print!("{}", toml::to_string_pretty(&config)?);
            }
            ConfigAction::Save(args) => {
                let config = effective_config(args);
                config.resolve()?;
                let path = config.save()?;
                println!("Saved config to: {}", path.display());
            }
        },
    }
    Ok(())
}
