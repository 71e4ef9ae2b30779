use bicare_triage::config::EngineConfig;

#[tokio::main]
async fn main() {
    bicare_triage::init_tracing();

    let result = match EngineConfig::from_env() {
        Ok(config) => bicare_triage::run(config).await,
        Err(e) => Err(e.into()),
    };

    if let Err(e) = result {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}
