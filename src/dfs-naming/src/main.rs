use dfs_naming::{NamingConfig, NamingServer};
use log::{error, info};
use std::env;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/dfs/naming.json";

fn usage() -> String {
    format!(
        "usage: dfs-naming [--config <path>]\n\
         defaults:\n\
         --config {}\n\
         (a missing config file means built-in defaults)",
        DEFAULT_CONFIG_PATH
    )
}

fn parse_args() -> Result<PathBuf, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => return Err(usage()),
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                config_path = PathBuf::from(value);
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }

    Ok(config_path)
}

fn load_config(path: &PathBuf) -> Result<NamingConfig, String> {
    if !path.exists() {
        return Ok(NamingConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("read config {}: {}", path.display(), e))?;
    serde_json::from_str(&raw).map_err(|e| format!("parse config {}: {}", path.display(), e))
}

fn main() {
    env_logger::init();
    let config_path = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };
    let config = match load_config(&config_path) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("create runtime failed: {}", e);
            std::process::exit(1);
        }
    };

    runtime.block_on(async move {
        let server = match NamingServer::new(config) {
            Ok(server) => server,
            Err(e) => {
                error!("create naming server failed: {}", e);
                std::process::exit(1);
            }
        };
        if let Err(e) = server.start().await {
            error!("start naming server failed: {}", e);
            std::process::exit(1);
        }
        info!(
            "naming server ready (service={:?}, registration={:?})",
            server.service_addr().await,
            server.registration_addr().await
        );

        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("wait for shutdown signal failed: {}", e);
        }
        server.stop().await;
    });
}
