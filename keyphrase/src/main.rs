use clap::Parser;
use keyphrase::KeyphraseService;
use keyphrase::server::{CliArgs, KeyphraseServer, ServerConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = CliArgs::parse();
    tracing::info!(port = args.port, batch_size = args.batch_size, "starting keyphrase");

    let service = match KeyphraseService::open(args.to_config()).await {
        Ok(service) => service,
        Err(e) => {
            tracing::error!(error = %e, "failed to open keyphrase service");
            std::process::exit(1);
        }
    };

    let server = KeyphraseServer::new(service, ServerConfig::from(&args));
    if let Err(e) = server.run().await {
        tracing::error!(error = %e, "keyphrase server failed");
        std::process::exit(1);
    }
}
