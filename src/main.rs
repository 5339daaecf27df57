use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::error;

use agrivision_i18n::market::{records_for_state, DataGovClient, MarketDataCache};
use agrivision_i18n::translate::LlmTranslator;
use agrivision_i18n::{init_tracing, I18nConfig, I18nContext, TextMap};

#[derive(Parser)]
#[command(name = "agrivision-i18n", version, about = "Translate UI label sets and inspect mandi prices")]
struct Cli {
    /// JSON config file (defaults to $AGRIVISION_I18N_CONFIG, then built-ins)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve a JSON object of key -> source string into the target language
    Translate {
        #[arg(long)]
        lang: String,
        #[arg(long)]
        texts: PathBuf,
    },
    /// Print mandi price records as JSON
    Market {
        #[arg(long)]
        state: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &cli.config {
        Some(path) => I18nConfig::load_from_file(path)?,
        None => I18nConfig::from_env_or_default()?,
    };

    match cli.command {
        Command::Translate { lang, texts } => {
            let raw = std::fs::read_to_string(&texts)?;
            let texts: TextMap = serde_json::from_str(&raw)?;

            let translator = LlmTranslator::new(&config.upstream, &config.separator)?;
            let context = I18nContext::start(config, Arc::new(translator));
            let facade = context.facade(texts);
            facade.set_language(&lang);
            let snapshot = facade.wait_settled().await;

            println!("{}", serde_json::to_string_pretty(&snapshot.resolved)?);
            if snapshot.degraded {
                eprintln!("warning: some labels fell back to their source text");
            }
            drop(facade);
            context.shutdown().await;
        }
        Command::Market { state } => {
            let client = DataGovClient::new(&config.market)?;
            let cache = MarketDataCache::new(
                Arc::new(client),
                config.market.ttl(),
                Arc::new(agrivision_i18n::MetricsRegistry::new()),
            );
            let records = cache.get().await?;
            let selected = match state {
                Some(state) => records_for_state(&records, &state),
                None => (*records).clone(),
            };
            println!("{}", serde_json::to_string_pretty(&selected)?);
        }
    }
    Ok(())
}
