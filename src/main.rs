use anyhow::bail;
use clap::Parser;
use rawhttp::config::Config;
use rawhttp::{Request, Response, Server};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .init();
    if let Err(e) = config.validate() {
        bail!("invalid configuration: {}", e);
    }
    info!(addr = config.address(), "starting server.");

    let server = Server::with_config(config.server_config());
    let handle = server.handle();
    let run_for = config.run_for();
    tokio::spawn(async move {
        match run_for {
            Some(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => info!(?duration, "run time elapsed."),
                    _ = tokio::signal::ctrl_c() => info!("interrupted."),
                }
            }
            None => {
                if let Err(error) = tokio::signal::ctrl_c().await {
                    warn!(?error, "failed to listen for ctrl-c, running until killed.");
                    std::future::pending::<()>().await;
                }
                info!("interrupted.");
            }
        }
        handle.stop();
    });

    server.serve(hello).await
}

fn hello(_req: &Request, res: &mut Response<'_>) {
    res.html(200, "<h2>你好</h2>");
}
