use atomic_ops::{oracle, store, AtomicBridge, PipelineConfig, RequestContext};
use std::io::{self, BufRead, Write};
use tracing::info;
use tracing_subscriber::EnvFilter;

const USER_ID: &str = "cli";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let config = PipelineConfig::from_env()?;
    let pool = store::connect(&config.database_url).await?;
    let oracle = oracle::from_config(&config)?;
    let bridge = AtomicBridge::new(pool, config, oracle);

    info!("Atomic operations pipeline ready");

    // One request from the arguments, or one per line from stdin.
    let args: Vec<String> = std::env::args().skip(1).collect();
    if !args.is_empty() {
        return run_once(&bridge, &args.join(" ")).await;
    }

    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit") {
            break;
        }
        run_once(&bridge, line).await?;
    }

    Ok(())
}

async fn run_once(bridge: &AtomicBridge, request: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = bridge
        .process_request(request, USER_ID, None, &RequestContext::default())
        .await?;

    println!("{}", result.response);
    if let Some(id) = result.operation_id {
        println!("[{:?}] operation {}", result.outcome, id);
    }
    for warning in &result.warnings {
        println!("  {}", warning);
    }
    Ok(())
}
