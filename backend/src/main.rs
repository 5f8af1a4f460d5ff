use airiq_backend::{api, config::Settings, db::Store};
use anyhow::{Context, Result};

#[actix_web::main]
async fn main() -> Result<()> {
    let settings = Settings::from_env()?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let store = Store::connect(&settings.database_url, settings.pool_size)
        .with_context(|| format!("cannot open database {}", settings.database_url))?;

    api::new_http_server(store, settings).await?;
    Ok(())
}
