use burrow::ServerConfig;
use clap::Parser;
use std::path::Path;

#[derive(Parser)]
#[clap(
    version,
    about = "Remote end of the burrow tunnel: accepts WebSocket tunnel sessions and acts as an unrestricted egress proxy"
)]
struct Args {
    #[clap(short, long, value_name = "ADDR", help = "Listen address, port defaults to $PORT or 8080")]
    listen: Option<String>,

    #[clap(long, value_name = "FILE", help = "Configuration file path (JSON)")]
    config: Option<String>,

    #[clap(long, help = "Expect UTF-8 packed tunnel payload")]
    text_frames: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut cfg = if let Some(path) = &args.config {
        if !Path::new(path).exists() {
            return Err(format!("configuration file not found: {}", path).into());
        }
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str::<ServerConfig>(&raw)?
    } else {
        ServerConfig::default()
    };

    if let Some(listen) = args.listen {
        cfg.listen = listen;
    }
    if args.text_frames {
        cfg.text_frames = true;
    }

    burrow::remote::serve(cfg).await?;
    Ok(())
}
