use anyhow::Result;
use async_trait::async_trait;
use std::{env, process, sync::Arc};
use tokio::io::{AsyncBufReadExt, BufReader};
use zerom2m::{
    DeviceEventHandler, Endpoint, StartupObserver, StartupStatus, ZeroClient, ZeroConfig,
    ZeroHandler,
};

struct Console;

#[async_trait]
impl DeviceEventHandler for Console {
    async fn on_progress(&self, message: &str) {
        println!("[LIB] {}", message);
    }

    async fn on_registry_updated(&self, devices: &[Endpoint]) {
        println!("[CLIENT] ==> {} device(s) known", devices.len());
    }
}

#[async_trait]
impl StartupObserver for Console {
    async fn on_startup(&self, status: &StartupStatus) {
        match status {
            StartupStatus::Ready => println!("[CLIENT] ==> Registered with the CSE"),
            StartupStatus::Degraded(reason) => println!("[CLIENT] ==> Running degraded: {}", reason),
            StartupStatus::Failed(reason) => println!("[CLIENT] ==> Registration failed: {}", reason),
            StartupStatus::Pending => {}
        }
    }
}

impl ZeroHandler for Console {}

async fn print_devices(client: &ZeroClient) -> Result<()> {
    let selected = client.selected().await?.map(|e| e.name);
    for device in client.devices().await? {
        let marker = if Some(&device.name) == selected.as_ref() { ">" } else { " " };
        println!("{} {}", marker, device);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    // Optional argument: path to a TOML config. Defaults otherwise.
    let args: Vec<String> = env::args().collect();
    let config = match args.len() {
        1 => ZeroConfig::default(),
        2 => ZeroConfig::load(&args[1])?,
        _ => {
            eprintln!("Usage: {} [config.toml]", args[0]);
            process::exit(1);
        }
    };

    let zerom2m = zerom2m::start(config, |_client| Arc::new(Console)).await?;
    let client = zerom2m.client().clone();
    println!("Commands: l(ist) n(ext) t(oggle) d(iscover) q(uit)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "l" => print_devices(&client).await?,
            "n" => {
                if let Some(device) = client.advance_selection().await? {
                    println!("[CLIENT] Selected {}", device);
                }
            }
            "t" => {
                if client.toggle_selected().await {
                    print_devices(&client).await?;
                } else {
                    println!("[CLIENT] Toggle failed");
                }
            }
            "d" => {
                let client = client.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.trigger_discovery().await {
                        eprintln!("[CLIENT] Discovery: {}", e);
                    }
                });
            }
            "q" => break,
            "" => {}
            other => println!("[CLIENT] Unknown command '{}'", other),
        }
    }

    zerom2m.shutdown().await;
    Ok(())
}
