use pulse_serve::{AppConfig, ServeConfig};

pub fn execute(bind: &str, port: u16) -> anyhow::Result<()> {
    let config = ServeConfig {
        bind: bind.to_string(),
        port,
    };
    let app_config = AppConfig::from_env();
    tokio::runtime::Runtime::new()?.block_on(pulse_serve::serve(config, app_config))
}
