use dfs_lib::NAMING_REGISTRATION_PORT;
use dfs_storage::StorageServer;
use log::{error, info};
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

struct RunOptions {
    root: PathBuf,
    hostname: IpAddr,
    naming: SocketAddr,
    data_addr: SocketAddr,
    command_addr: SocketAddr,
}

fn usage() -> String {
    format!(
        "usage: dfs-storage <root> [--naming <addr>] [--host <ip>] [--data-port <n>] [--command-port <n>]\n\
         defaults:\n\
         --naming 127.0.0.1:{}\n\
         --host 127.0.0.1\n\
         --data-port 0 (system picks)\n\
         --command-port 0 (system picks)",
        NAMING_REGISTRATION_PORT
    )
}

fn parse_args() -> Result<RunOptions, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    if args.is_empty() || args[0] == "-h" || args[0] == "--help" {
        return Err(usage());
    }

    let root = PathBuf::from(args[0].clone());
    let mut hostname: IpAddr = "127.0.0.1".parse().map_err(|e| format!("{}", e))?;
    let mut naming: SocketAddr = format!("127.0.0.1:{}", NAMING_REGISTRATION_PORT)
        .parse()
        .map_err(|e| format!("{}", e))?;
    let mut data_port = 0u16;
    let mut command_port = 0u16;

    let mut i = 1usize;
    while i < args.len() {
        let flag = args[i].as_str();
        i += 1;
        let value = args
            .get(i)
            .ok_or_else(|| format!("missing value for {}", flag))?;
        match flag {
            "--naming" => {
                naming = value
                    .parse()
                    .map_err(|e| format!("bad --naming {}: {}", value, e))?;
            }
            "--host" => {
                hostname = value
                    .parse()
                    .map_err(|e| format!("bad --host {}: {}", value, e))?;
            }
            "--data-port" => {
                data_port = value
                    .parse()
                    .map_err(|e| format!("bad --data-port {}: {}", value, e))?;
            }
            "--command-port" => {
                command_port = value
                    .parse()
                    .map_err(|e| format!("bad --command-port {}: {}", value, e))?;
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }

    Ok(RunOptions {
        root,
        hostname,
        naming,
        data_addr: SocketAddr::from(([0, 0, 0, 0], data_port)),
        command_addr: SocketAddr::from(([0, 0, 0, 0], command_port)),
    })
}

fn main() {
    env_logger::init();
    let options = match parse_args() {
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
        let server = match StorageServer::new(options.root, options.data_addr, options.command_addr)
        {
            Ok(server) => server,
            Err(e) => {
                error!("create storage server failed: {}", e);
                std::process::exit(1);
            }
        };
        if let Err(e) = server.start(options.hostname, options.naming).await {
            error!("start storage server failed: {}", e);
            std::process::exit(1);
        }
        info!(
            "storage server ready (data={:?}, command={:?})",
            server.data_addr().await,
            server.command_addr().await
        );

        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("wait for shutdown signal failed: {}", e);
        }
        server.stop().await;
    });
}
