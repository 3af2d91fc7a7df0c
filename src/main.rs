use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand};
use forkbus::{postoffice, PublishOptions, Scope, SubscribeOptions};

#[derive(Parser)]
#[command(name = "forkbus", about = "forkbus cluster demo")]
struct Cli {
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Run the cluster root and spawn worker processes.
    Root {
        #[arg(long, default_value_t = 2)]
        workers: usize,
    },
    /// Connect to a running root (socket path from FORKBUS_SOCKET).
    Worker,
}

#[tokio::main]
async fn main() {
    forkbus::logging::init_logging();
    let cli = Cli::parse();
    let result = match cli.role {
        Role::Root { workers } => run_root(workers).await,
        Role::Worker => run_worker().await,
    };
    if let Err(e) = result {
        eprintln!("[FATAL] {e}");
        process::exit(1);
    }
}

async fn run_root(workers: usize) -> anyhow::Result<()> {
    let bus = postoffice();
    bus.listen()?;
    bus.startup();

    let _sub = bus.subscribe(SubscribeOptions::channel("demo", |msg| {
        tracing::info!(payload = ?msg.payload(), "root received");
    }));

    // workers inherit FORKBUS_SOCKET and find the root through it
    let exe = std::env::current_exe()?;
    let mut children = Vec::new();
    for _ in 0..workers {
        children.push(process::Command::new(&exe).arg("worker").spawn()?);
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut n = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                n += 1;
                bus.publish(
                    PublishOptions::channel("demo")
                        .payload(format!("tick {n}"))
                        .scope(Scope::Cluster),
                );
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    forkbus::signal_children();
    bus.finish();
    bus.at_exit();
    for mut child in children {
        let _ = child.wait();
    }
    Ok(())
}

async fn run_worker() -> anyhow::Result<()> {
    let bus = postoffice();
    bus.connect(None).await?;
    bus.startup();

    let pid = process::id();
    let _sub = bus.subscribe(SubscribeOptions::channel("demo", move |msg| {
        tracing::info!(pid, payload = ?msg.payload(), "worker received");
    }));
    bus.publish(
        PublishOptions::channel("demo")
            .payload(format!("worker {pid} online"))
            .scope(Scope::Root),
    );

    tokio::signal::ctrl_c().await?;
    bus.finish();
    bus.at_exit();
    Ok(())
}
