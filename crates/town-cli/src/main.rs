use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use contracts::WorldConfig;
use town_api::{serve, EngineApi};
use tracing::error;

const DEFAULT_DB_PATH: &str = "town_world.sqlite";

fn print_usage() {
    println!("town-cli <command>");
    println!("commands:");
    println!("  status            print the engine document");
    println!("  step [ms]         advance the world by ms of simulated time (default 1000)");
    println!("  serve [addr]      run the api server and agents");
    println!("    default addr: 127.0.0.1:8080");
    println!("environment:");
    println!("  OPENAI_API_KEY    required for serve");
    println!("  TOWN_DB           sqlite path (default {DEFAULT_DB_PATH}; \"none\" disables)");
}

fn parse_socket_addr(value: Option<&String>) -> Result<SocketAddr, String> {
    let raw = value.map(String::as_str).unwrap_or("127.0.0.1:8080");
    raw.parse::<SocketAddr>()
        .map_err(|_| format!("invalid addr: {raw}"))
}

fn db_path() -> Option<PathBuf> {
    match env::var("TOWN_DB") {
        Ok(raw) if raw == "none" => None,
        Ok(raw) => Some(PathBuf::from(raw)),
        Err(_) => Some(PathBuf::from(DEFAULT_DB_PATH)),
    }
}

fn open_api() -> EngineApi {
    let Some(path) = db_path() else {
        return EngineApi::from_config(WorldConfig::default());
    };
    match EngineApi::load(&path) {
        Ok(Some(resumed)) => resumed,
        Ok(None) => {
            let mut fresh = EngineApi::from_config(WorldConfig::default());
            if let Err(err) = fresh.attach_sqlite_store(&path) {
                eprintln!("warning: running without persistence: {err}");
            }
            fresh
        }
        Err(err) => {
            eprintln!("error: could not open {}: {err}", path.display());
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str);

    match command {
        Some("status") => {
            let api = open_api();
            let doc = api.engine_doc();
            println!(
                "engine={} generation={} running={} current_time={:?}",
                doc.id,
                doc.generation_number,
                doc.state.is_running(),
                doc.current_time,
            );
        }
        Some("step") => {
            let ms = args
                .get(2)
                .and_then(|raw| raw.parse::<f64>().ok())
                .unwrap_or(1000.0);
            let mut api = open_api();
            let doc = api.engine_doc();
            let from = doc.last_step_ts.unwrap_or(0.0);
            if !doc.state.is_running() {
                api.start(from);
            }
            let target = from + ms;
            let generation = api.engine_doc().generation_number;
            let committed = api.run_step(generation, target);
            println!(
                "committed={} current_time={:?}",
                committed,
                api.engine_doc().current_time,
            );
        }
        Some("serve") => match parse_socket_addr(args.get(2)) {
            Ok(addr) => {
                // The secret check runs before binding so a bad environment
                // fails fast with the remediation text.
                if let Err(err) = town_api::llm::LlmConfig::from_env() {
                    eprintln!("fatal: {err}");
                    std::process::exit(1);
                }
                println!("serving town api on http://{addr}");
                if let Err(err) = serve(addr, db_path()).await {
                    error!(error = %err, "server exited");
                    std::process::exit(1);
                }
            }
            Err(err) => {
                eprintln!("error: {err}");
                print_usage();
                std::process::exit(2);
            }
        },
        _ => {
            print_usage();
        }
    }
}
