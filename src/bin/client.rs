use burrow::ClientConfig;
use clap::Parser;
use std::path::Path;

#[derive(Parser)]
#[clap(
    version,
    about = "Local proxy end of the burrow tunnel: serves browser requests via the corporate NTLM proxy, rerouting filtered hosts through the remote server"
)]
struct Args {
    #[clap(short, long, value_name = "PORT", help = "The port this server is going to listen on")]
    port: Option<u16>,

    #[clap(long, value_name = "URL", help = "Address of the remote server, $REMOTE_PROXY if set")]
    host: Option<String>,

    #[clap(long, value_name = "URL", help = "Address of the HTTP proxy server, $HTTP_PROXY if set")]
    proxy: Option<String>,

    #[clap(long, value_name = "AGENT", help = "User-Agent of upstream requests, $AGENT if set")]
    agent: Option<String>,

    #[clap(long, value_name = "USER", help = "NTLM user for the HTTP proxy, $PROXY_USER if set")]
    user: Option<String>,

    #[clap(long, value_name = "PASS", help = "NTLM password, $PROXY_PASS if set")]
    password: Option<String>,

    #[clap(long, value_name = "DOMAIN", help = "NTLM domain, $PROXY_DOMAIN if set")]
    domain: Option<String>,

    #[clap(long, value_name = "FILE", help = "Route decision file")]
    routes: Option<String>,

    #[clap(long, value_name = "FILE", help = "Configuration file path (JSON)")]
    config: Option<String>,

    #[clap(long, help = "Pack the tunnel payload into UTF-8 text")]
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
        serde_json::from_str::<ClientConfig>(&raw)?
    } else {
        ClientConfig::default()
    };

    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(host) = args.host {
        cfg.remote = host;
    }
    if let Some(proxy) = args.proxy {
        cfg.proxy = Some(proxy);
    }
    if let Some(agent) = args.agent {
        cfg.agent = Some(agent);
    }
    if let Some(user) = args.user {
        cfg.user = Some(user);
    }
    if let Some(password) = args.password {
        cfg.password = Some(password);
    }
    if let Some(domain) = args.domain {
        cfg.domain = Some(domain);
    }
    if let Some(routes) = args.routes {
        cfg.route_file = routes;
    }
    if args.text_frames {
        cfg.text_frames = true;
    }

    burrow::client::run(cfg).await?;
    Ok(())
}
