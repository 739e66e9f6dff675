//! Kontura server binary.
//!
//! Subcommands:
//!   serve [--config PATH]        run the server (default)
//!   check [--config PATH]        probe configured endpoints and exit
//!   verify-audit [--config PATH] verify the audit chain and exit
//!   add-user USER ROLE [--config PATH]   create an operator account
//!
//! Exit codes: 0 success, 2 configuration error, 3 dependency
//! unreachable, 4 audit/integrity verification failed.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use kontura::config::Config;
use kontura::core_state::{CoreError, CoreState};
use kontura::models::Role;

const EXIT_CONFIG: u8 = 2;
const EXIT_DEPENDENCY: u8 = 3;
const EXIT_INTEGRITY: u8 = 4;

struct Args {
    command: String,
    config_path: PathBuf,
    rest: Vec<String>,
}

fn parse_args() -> Args {
    let mut args = std::env::args().skip(1).collect::<Vec<_>>();
    let mut config_path = PathBuf::from("kontura.json");

    if let Some(pos) = args.iter().position(|a| a == "--config") {
        args.remove(pos);
        if pos < args.len() {
            config_path = PathBuf::from(args.remove(pos));
        }
    }

    let command = if args.first().map(|a| !a.starts_with('-')).unwrap_or(false) {
        args.remove(0)
    } else {
        "serve".to_string()
    };

    Args {
        command,
        config_path,
        rest: args,
    }
}

fn load_config(path: &PathBuf) -> Result<Config, ExitCode> {
    match Config::load(path) {
        Ok(config) => Ok(config),
        Err(e) => {
            eprintln!("configuration error: {e}");
            Err(ExitCode::from(EXIT_CONFIG))
        }
    }
}

fn build_core(config: Config) -> Result<Arc<CoreState>, ExitCode> {
    match CoreState::initialize(config) {
        Ok(core) => Ok(core),
        Err(CoreError::AuditIntegrity(e)) => {
            eprintln!("audit chain verification failed: {e}");
            Err(ExitCode::from(EXIT_INTEGRITY))
        }
        Err(e) => {
            eprintln!("startup error: {e}");
            Err(ExitCode::from(EXIT_CONFIG))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = parse_args();

    match args.command.as_str() {
        "serve" => serve(&args).await,
        "check" => check(&args).await,
        "verify-audit" => verify_audit(&args),
        "add-user" => add_user(&args),
        other => {
            eprintln!("unknown command: {other}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

async fn serve(args: &Args) -> ExitCode {
    let config = match load_config(&args.config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    kontura::init_tracing(&config.log_filter);
    tracing::info!("Kontura starting v{}", kontura::config::APP_VERSION);

    let host = config.host.clone();
    let port = config.port;
    let core = match build_core(config) {
        Ok(core) => core,
        Err(code) => return code,
    };

    let _maintenance = kontura::maintenance::spawn(core.clone());

    let server = match kontura::api::ApiServer::start(core, &host, port).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("cannot bind {host}:{port}: {e}");
            return ExitCode::from(EXIT_DEPENDENCY);
        }
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => tracing::error!("Signal handler failed: {e}"),
    }
    server.stop().await;
    ExitCode::SUCCESS
}

/// Probe the configured inference and embedding endpoints.
async fn check(args: &Args) -> ExitCode {
    let config = match load_config(&args.config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()
        .expect("HTTP client");

    let mut ok = true;
    for (name, endpoint) in [
        ("inference", &config.inference_endpoint),
        ("embedding", &config.embedding_endpoint),
    ] {
        let url = format!("{}/v1/models", endpoint.url.trim_end_matches('/'));
        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                println!("{name}: ok ({})", endpoint.model);
            }
            Ok(response) => {
                println!("{name}: unexpected status {}", response.status());
                ok = false;
            }
            Err(e) => {
                println!("{name}: unreachable ({e})");
                ok = false;
            }
        }
    }

    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_DEPENDENCY)
    }
}

fn verify_audit(args: &Args) -> ExitCode {
    let config = match load_config(&args.config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };

    let db = match kontura::db::Database::initialize(config.db_path()) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("cannot open database: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let conn = match db.open() {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("cannot open database: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match kontura::audit::verify(&conn, None) {
        Ok(count) => {
            println!("audit chain intact: {count} events");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("audit chain BROKEN: {e}");
            ExitCode::from(EXIT_INTEGRITY)
        }
    }
}

fn add_user(args: &Args) -> ExitCode {
    let config = match load_config(&args.config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };

    let (username, role) = match (args.rest.first(), args.rest.get(1)) {
        (Some(u), Some(r)) => (u.clone(), r.clone()),
        _ => {
            eprintln!("usage: kontura add-user USERNAME ROLE [--config PATH]");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let Some(role) = Role::parse(&role) else {
        eprintln!("role must be admin, accountant, or assistant");
        return ExitCode::from(EXIT_CONFIG);
    };

    let password = match std::env::var("KONTURA_NEW_PASSWORD") {
        Ok(p) if !p.is_empty() => p,
        _ => {
            eprintln!("set KONTURA_NEW_PASSWORD for the new account");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let db = match kontura::db::Database::initialize(config.db_path()) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("cannot open database: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let conn = match db.open() {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("cannot open database: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match kontura::auth::create_user(&conn, &username, &password, role) {
        Ok(id) => {
            println!("created {username} ({})", id);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("cannot create user: {e}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}
