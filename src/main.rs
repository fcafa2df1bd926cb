use std::env;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use modelgate::colors::*;
use modelgate::config::{self, Config};
use modelgate::error::StoreError;
use modelgate::gateway::Gateway;
use modelgate::log_sink::LogSink;
use modelgate::models;
use modelgate::server::ServerState;
use modelgate::store::{JsonStore, ModelConfig, ModelStore};

#[tokio::main]
async fn main() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args: Vec<String> = env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "serve" => {
                run_serve_command(&args[2..]).await;
                return;
            }
            "models" => {
                run_models_command(&args[2..]);
                return;
            }
            "test" => {
                run_test_command(&args[2..]).await;
                return;
            }
            "logs" => {
                run_logs_command(&args[2..]);
                return;
            }
            "config" => {
                run_config_command();
                return;
            }
            "-h" | "--help" | "help" => {
                print_help();
                return;
            }
            "-V" | "--version" | "version" => {
                println!("modelgate {}", env!("CARGO_PKG_VERSION"));
                return;
            }
            arg if !arg.starts_with('-') => {
                eprintln!("{RED}Unknown command:{RESET} {arg}");
                eprintln!();
                eprintln!("Run '{YELLOW}modelgate --help{RESET}' for usage information.");
                std::process::exit(1);
            }
            _ => {} // Options like --port, --debug belong to serve
        }
    }

    run_serve_command(&args[1..]).await;
}

async fn run_serve_command(args: &[String]) {
    let mut port: Option<u16> = None;
    let mut host: Option<String> = None;
    let mut debug = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                match args.get(i).map(|s| s.parse::<u16>()) {
                    Some(Ok(p)) => port = Some(p),
                    Some(Err(_)) => {
                        eprintln!(
                            "{RED}Invalid port:{RESET} '{}' is not a valid port number (0-65535)",
                            args[i]
                        );
                        std::process::exit(1);
                    }
                    None => {
                        eprintln!("{RED}Missing value:{RESET} --port requires a port number");
                        std::process::exit(1);
                    }
                }
            }
            "--host" => {
                i += 1;
                match args.get(i) {
                    Some(h) => host = Some(h.clone()),
                    None => {
                        eprintln!("{RED}Missing value:{RESET} --host requires an IP address");
                        std::process::exit(1);
                    }
                }
            }
            "--debug" | "-d" => debug = true,
            "-h" | "--help" => {
                print_help();
                return;
            }
            "-V" | "--version" => {
                println!("modelgate {}", env!("CARGO_PKG_VERSION"));
                return;
            }
            arg => {
                eprintln!("{RED}Unknown option:{RESET} {arg}");
                eprintln!();
                eprintln!("Run '{YELLOW}modelgate --help{RESET}' for usage information.");
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let config = load_config_or_exit().with_overrides(port, host, debug);
    config::init_config(config.clone());
    init_logging_foreground(config.logging.debug);

    let store = open_store_or_exit(&config);
    let preferred_port = match config.server.port {
        Some(p) => p,
        None => match store.server_settings() {
            Ok(settings) => settings.port,
            Err(e) => {
                error!(error = %e, "Failed to read server settings");
                std::process::exit(1);
            }
        },
    };

    let enabled = store.enabled_models().map(|m| m.len()).unwrap_or(0);
    info!(
        store = %config.store_path().display(),
        enabled_models = enabled,
        "Loaded model store"
    );

    let state = Arc::new(ServerState::new(
        store,
        LogSink::new(),
        config.server.max_connections,
    ));
    let gateway = Gateway::new(state, config.host());

    let port = match gateway.start(preferred_port).await {
        Ok(port) => port,
        Err(e) => {
            eprintln!("{RED}Error:{RESET} {e}");
            if let Some(suggestion) = e.suggestion() {
                eprintln!();
                eprintln!("  {YELLOW}Tip:{RESET} {suggestion}");
            }
            std::process::exit(1);
        }
    };

    println!();
    println!("{GREEN}●{RESET} {BOLD}modelgate{RESET} running");
    println!("  Base URL {CYAN}http://127.0.0.1:{port}/v1{RESET}");
    if enabled == 0 {
        println!(
            "  {YELLOW}No enabled models.{RESET} {DIM}Add one with 'modelgate models add'{RESET}"
        );
    }
    println!();

    shutdown_signal().await;
    info!("Received shutdown signal, stopping server");
    gateway.stop().await;
}

fn run_models_command(args: &[String]) {
    let config = load_config_or_exit();
    let store = open_store_or_exit(&config);

    let subcommand = args.first().map(|s| s.as_str()).unwrap_or("list");
    let model_arg = || match args.get(1) {
        Some(id) if !id.starts_with('-') => id.clone(),
        _ => {
            eprintln!("{RED}Missing value:{RESET} models {subcommand} requires a model id");
            std::process::exit(1);
        }
    };

    match subcommand {
        "list" | "ls" => {
            let query = args.get(1).map(|s| s.as_str()).unwrap_or("");
            print_models(&store, query);
        }
        "add" => {
            let model_id = model_arg();
            add_model(&store, model_id, &args[2..]);
        }
        "remove" | "rm" => {
            let model_id = model_arg();
            match store.remove_model(&model_id) {
                Ok(0) => not_configured(&model_id),
                Ok(n) => println!("{GREEN}✓{RESET} Removed {model_id} ({n} record(s))"),
                Err(e) => exit_with_error(&e),
            }
        }
        "enable" | "disable" => {
            let model_id = model_arg();
            let enabled = subcommand == "enable";
            match store.set_enabled(&model_id, enabled) {
                Ok(0) => not_configured(&model_id),
                Ok(_) => println!("{GREEN}✓{RESET} {model_id} {subcommand}d"),
                Err(e) => exit_with_error(&e),
            }
        }
        other => {
            eprintln!("{RED}Unknown models subcommand:{RESET} {other}");
            eprintln!("Usage: modelgate models [list|add|remove|enable|disable]");
            std::process::exit(1);
        }
    }
}

fn print_models(store: &JsonStore, query: &str) {
    let all = match store.all_models() {
        Ok(models) => models,
        Err(e) => exit_with_error(&e),
    };

    if all.is_empty() {
        println!();
        println!("{DIM}No models configured.{RESET}");
        println!("Run '{GREEN}modelgate models add <model-id> --url <api-url> --key <key>{RESET}' to add one.");
        println!();
        return;
    }

    let matching = models::filter_models(&all, query);
    println!();
    println!("{BOLD}{GREEN}Models{RESET} ({} of {})", matching.len(), all.len());
    println!();
    for model in matching {
        let status = if model.enabled {
            format!("{GREEN}enabled{RESET}")
        } else {
            format!("{DIM}disabled{RESET}")
        };
        println!(
            "  {BOLD}{}{RESET} {} {DIM}({}){RESET}",
            model.model_id, status, model.provider
        );
        if model.name != model.model_id {
            println!("    name: {}", model.name);
        }
        println!("    url:  {CYAN}{}{RESET}", model.api_url);
        println!("    key:  {DIM}{}{RESET}", models::mask_key(&model.api_key));
    }
    println!();
}

fn add_model(store: &JsonStore, model_id: String, args: &[String]) {
    let mut url: Option<String> = None;
    let mut key: Option<String> = None;
    let mut provider: Option<String> = None;
    let mut name: Option<String> = None;
    let mut enabled = true;

    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        let mut value = || {
            i += 1;
            match args.get(i) {
                Some(v) => v.clone(),
                None => {
                    eprintln!("{RED}Missing value:{RESET} {flag} requires a value");
                    std::process::exit(1);
                }
            }
        };
        match flag {
            "--url" => url = Some(value()),
            "--key" => key = Some(value()),
            "--provider" => provider = Some(value()),
            "--name" => name = Some(value()),
            "--disabled" => enabled = false,
            other => {
                eprintln!("{RED}Unknown option:{RESET} {other}");
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let (Some(url), Some(key)) = (url, key) else {
        eprintln!("{RED}Missing value:{RESET} models add requires --url and --key");
        eprintln!(
            "Usage: modelgate models add <model-id> --url <api-url> --key <key> [--provider P] [--name N] [--disabled]"
        );
        std::process::exit(1);
    };

    let existing = match store.all_models() {
        Ok(models) => models.into_iter().rev().find(|m| m.model_id == model_id),
        Err(e) => exit_with_error(&e),
    };
    let updating = existing.is_some();

    let mut model = existing.unwrap_or_else(|| ModelConfig::new(&model_id, "custom", "", ""));
    model.api_url = url;
    model.api_key = key;
    model.enabled = enabled;
    if let Some(provider) = provider {
        model.provider = provider;
    }
    if let Some(name) = name {
        model.name = name;
    }

    if let Err(e) = store.upsert_model(model) {
        exit_with_error(&e);
    }
    let verb = if updating { "Updated" } else { "Added" };
    println!("{GREEN}✓{RESET} {verb} {model_id}");
}

async fn run_test_command(args: &[String]) {
    let Some(model_id) = args.first() else {
        eprintln!("Usage: modelgate test <model-id>");
        std::process::exit(1);
    };

    let config = load_config_or_exit();
    init_logging_foreground(config.logging.debug);
    let store = open_store_or_exit(&config);

    let model = match store.all_models() {
        Ok(models) => models
            .into_iter()
            .filter(|m| &m.model_id == model_id)
            .max_by_key(|m| m.created_at),
        Err(e) => exit_with_error(&e),
    };
    let Some(model) = model else {
        not_configured(model_id);
    };

    println!("Testing {BOLD}{}{RESET} at {CYAN}{}{RESET}...", model.model_id, model.api_url);

    let state = Arc::new(ServerState::new(store, LogSink::new(), 1));
    let gateway = Gateway::new(state, config.host());
    match gateway.test_connection(&model).await {
        Ok(test) => {
            println!(
                "{GREEN}✓{RESET} HTTP {} in {} ms",
                test.status.as_u16(),
                test.duration.as_millis()
            );
        }
        Err(e) => {
            eprintln!("{RED}✗{RESET} {e}");
            if let Some(suggestion) = e.suggestion() {
                eprintln!("  {YELLOW}Tip:{RESET} {suggestion}");
            }
            std::process::exit(1);
        }
    }
}

fn run_logs_command(args: &[String]) {
    let mut count = 20usize;

    let mut i = 0;
    while i < args.len() {
        if let "-n" | "--lines" = args[i].as_str() {
            i += 1;
            match args.get(i).map(|s| s.parse::<usize>()) {
                Some(Ok(n)) if n > 0 => count = n,
                _ => {
                    eprintln!(
                        "{YELLOW}Warning:{RESET} --lines needs a positive number, using default (20)"
                    );
                }
            }
        }
        i += 1;
    }

    let config = load_config_or_exit();
    let store = open_store_or_exit(&config);
    let rows = match store.recent_logs(count) {
        Ok(rows) => rows,
        Err(e) => exit_with_error(&e),
    };

    if rows.is_empty() {
        println!("{DIM}No requests logged yet.{RESET}");
        return;
    }

    for row in rows {
        let outcome = match (row.status_code, &row.error_message) {
            (Some(code), _) if (200..300).contains(&code) => format!("{GREEN}{code}{RESET}"),
            (Some(code), _) => format!("{YELLOW}{code}{RESET}"),
            (None, Some(message)) => format!("{RED}{message}{RESET}"),
            (None, None) => format!("{DIM}-{RESET}"),
        };
        let duration = row
            .duration_ms
            .map(|ms| format!("{ms} ms"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{DIM}{}{RESET} {} {} {BOLD}{}{RESET} {} {DIM}{}{RESET}",
            row.timestamp.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"),
            row.method,
            row.path,
            row.model_id,
            outcome,
            duration
        );
    }
}

fn run_config_command() {
    println!();
    println!("{BOLD}{GREEN}modelgate Configuration{RESET}");
    println!();

    let config_path = Config::path();
    println!("{BOLD}Config file:{RESET}");
    if config_path.exists() {
        println!("  {CYAN}{}{RESET}", config_path.display());
    } else {
        println!(
            "  {} {DIM}{YELLOW}(not created yet){RESET}",
            config_path.display()
        );
    }
    println!();

    let config = load_config_or_exit();

    println!("{BOLD}Current settings:{RESET}");
    println!();
    println!("  {DIM}[server]{RESET}");
    match config.server.port {
        Some(port) => println!("    port = {CYAN}{port}{RESET}"),
        None => println!("    port = {DIM}(from store settings){RESET}"),
    }
    println!("    host = {CYAN}\"{}\"{RESET}", config.server.host);
    println!(
        "    max_connections = {CYAN}{}{RESET}",
        config.server.max_connections
    );
    println!();
    println!("  {DIM}[logging]{RESET}");
    println!("    debug = {CYAN}{}{RESET}", config.logging.debug);
    println!("    log_requests = {CYAN}{}{RESET}", config.logging.log_requests);
    println!();
    println!("  {DIM}[store]{RESET}");
    println!("    path = {CYAN}\"{}\"{RESET}", config.store_path().display());
    println!();

    let store = open_store_or_exit(&config);
    match store.server_settings() {
        Ok(settings) => {
            println!("{BOLD}Server settings (store):{RESET}");
            println!(
                "    host = {CYAN}\"{}\"{RESET} {DIM}(not used, [server] host is bound){RESET}",
                settings.host
            );
            println!("    port = {CYAN}{}{RESET}", settings.port);
            println!(
                "    request_timeout_secs = {CYAN}{}{RESET}",
                settings.request_timeout_secs
            );
            println!(
                "    max_retries = {CYAN}{}{RESET} {DIM}(not used){RESET}",
                settings.max_retries
            );
            println!(
                "    retry_delay_ms = {CYAN}{}{RESET} {DIM}(not used){RESET}",
                settings.retry_delay_ms
            );
            println!("    is_running = {CYAN}{}{RESET}", settings.is_running);
        }
        Err(e) => println!("  {RED}Failed to read server settings:{RESET} {e}"),
    }
    println!();

    println!("{BOLD}Environment variables:{RESET}");
    match std::env::var("MODELGATE_STORE") {
        Ok(path) => println!("  {YELLOW}MODELGATE_STORE{RESET} = {path}"),
        Err(_) => println!("  {DIM}(none set){RESET}"),
    }
    println!();
}

fn load_config_or_exit() -> Config {
    match Config::load() {
        Ok(config) => config.with_overrides(None, None, false),
        Err(e) => {
            eprintln!("{RED}Error:{RESET} {e}");
            if let config::ConfigError::ParseError { path, source } = &e {
                eprintln!();
                eprintln!("  Config file: {}", path.display());
                let msg = source.to_string();
                if let Some(line_info) = msg.split(" at line ").nth(1) {
                    eprintln!(
                        "  Location: line {}",
                        line_info.split_whitespace().next().unwrap_or("?")
                    );
                }
                eprintln!();
                eprintln!("  {DIM}Fix the syntax error and try again.{RESET}");
            }
            std::process::exit(1);
        }
    }
}

fn open_store_or_exit(config: &Config) -> Arc<JsonStore> {
    let path = config.store_path();
    match JsonStore::open(&path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("{RED}Failed to open model store:{RESET} {e}");
            if matches!(e, StoreError::Corrupt { .. }) {
                eprintln!();
                eprintln!(
                    "  {DIM}Fix or move {} and try again.{RESET}",
                    path.display()
                );
            }
            std::process::exit(1);
        }
    }
}

fn exit_with_error(e: &StoreError) -> ! {
    eprintln!("{RED}Store error:{RESET} {e}");
    std::process::exit(1);
}

fn not_configured(model_id: &str) -> ! {
    eprintln!("{RED}Model not configured:{RESET} {model_id}");
    eprintln!("Run '{YELLOW}modelgate models{RESET}' to see configured models.");
    std::process::exit(1);
}

fn init_logging_foreground(debug: bool) {
    let filter = if debug {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("modelgate=debug,warn"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("modelgate=info,warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn print_help() {
    println!(
        r#"
{BOLD}{GREEN}modelgate{RESET} {DIM}local OpenAI-compatible gateway for your own model keys{RESET}

{BOLD}USAGE:{RESET}  {GREEN}modelgate{RESET} [COMMAND] [OPTIONS]

{BOLD}COMMANDS{RESET}
┌───────────────────────────────┬────────────────────────────────────────┐
│ {YELLOW}serve{RESET}                         │ Run the gateway {DIM}(default){RESET}                │
│ {YELLOW}models{RESET} [list [filter]]         │ List configured models                 │
│ {YELLOW}models add{RESET} <id> --url --key    │ Add or update a model                  │
│ {YELLOW}models remove{RESET} <id>             │ Remove a model                         │
│ {YELLOW}models enable{RESET}|{YELLOW}disable{RESET} <id>    │ Toggle whether a model is served       │
│ {YELLOW}test{RESET} <id>                      │ Send a minimal request to a model      │
│ {YELLOW}logs{RESET}                          │ Show recent forwarded requests         │
│ {YELLOW}config{RESET}                        │ Show current configuration             │
│ {YELLOW}version{RESET}                       │ Show version information               │
│ {YELLOW}help{RESET}                          │ Show this help message                 │
└───────────────────────────────┴────────────────────────────────────────┘

{BOLD}OPTIONS{RESET}
┌───────────────────────────────┬────────────────────────────────────────┐
│ {YELLOW}-p{RESET}, {YELLOW}--port{RESET} <PORT>             │ Preferred port {DIM}(default: 3000){RESET}       │
│ {YELLOW}--host{RESET} <HOST>                 │ Bind address {DIM}(default: 0.0.0.0){RESET}      │
│ {YELLOW}-d{RESET}, {YELLOW}--debug{RESET}                   │ Enable debug logging                   │
│ {YELLOW}-n{RESET}, {YELLOW}--lines{RESET} <N>               │ {DIM}logs:{RESET} Show last N rows {DIM}(default: 20){RESET} │
├───────────────────────────────┼────────────────────────────────────────┤
│ {YELLOW}--provider{RESET} <NAME>             │ {DIM}models add:{RESET} Provider label            │
│ {YELLOW}--name{RESET} <NAME>                 │ {DIM}models add:{RESET} Display name              │
│ {YELLOW}--disabled{RESET}                    │ {DIM}models add:{RESET} Add without serving it    │
└───────────────────────────────┴────────────────────────────────────────┘

{BOLD}EXAMPLES{RESET}
  {GREEN}modelgate models add gpt-4o --url https://api.openai.com/v1 --key sk-...{RESET}
  {GREEN}modelgate test gpt-4o{RESET}             {DIM}# Check the key and URL{RESET}
  {GREEN}modelgate --port 3000{RESET}             {DIM}# Start the gateway{RESET}
  {GREEN}modelgate logs -n 50{RESET}              {DIM}# Last 50 forwarded requests{RESET}

{DIM}Ports tried when busy: 3001, 3002, 3003, 8080, 8081
Config: ~/.config/modelgate/config.toml
Store:  ~/.config/modelgate/store.json{RESET}
"#
    );
}
