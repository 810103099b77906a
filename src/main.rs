use clap::Parser;
use logship::{app, cli::Opts};
use tracing::error;
use tracing_subscriber::EnvFilter;

fn init_logging(opts: &Opts) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&opts.log_level));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    if opts.log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() {
    let opts = Opts::parse();
    init_logging(&opts);

    if let Err(error) = app::run(opts).await {
        error!(message = "Startup failed.", %error);
        std::process::exit(app::exit_code(&error));
    }
}
