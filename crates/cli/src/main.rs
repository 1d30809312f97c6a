mod app;
mod input;
mod logging;
mod render;

use parley_core::config;

#[tokio::main]
async fn main() {
    let config = match config::load_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    logging::init(&config.logging.level);

    if let Err(e) = app::run(config).await {
        eprintln!("parley error: {e}");
        std::process::exit(1);
    }
}
