use clap::Parser;

use lumen_engine::args::Args;
use lumen_engine::{Engine, EngineConfig};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = EngineConfig::from(Args::parse());
    if let Err(e) = Engine::new(config).and_then(|mut engine| engine.run()) {
        log::error!("{e}");
        std::process::exit(1);
    }
}
