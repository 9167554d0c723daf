use opendata_gateway::gateway::{Gateway, GatewayConfig, GatewayHttpState, SqliteStore, router};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().ok_or(
        "usage: opendata-gateway <config.json> [--listen HOST:PORT] [--sqlite PATH] [--admin-token TOKEN]",
    )?;

    let mut listen = "127.0.0.1:8080".to_string();
    let mut sqlite_path = std::path::PathBuf::from("opendata-gateway.sqlite");
    let mut admin_token: Option<String> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen = args.next().ok_or("missing value for --listen/--addr")?;
            }
            "--sqlite" => {
                sqlite_path = args.next().ok_or("missing value for --sqlite")?.into();
            }
            "--admin-token" => {
                admin_token = Some(args.next().ok_or("missing value for --admin-token")?);
            }
            other => {
                return Err(format!("unknown argument: {other}").into());
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let raw = std::fs::read_to_string(&config_path)?;
    let config: GatewayConfig = serde_json::from_str(&raw)?;

    let store = SqliteStore::new(&sqlite_path);
    store.init().await?;

    let gateway = Gateway::new(config, store)?;
    gateway.ledger().bootstrap().await?;
    // Provision an account per configured permit owner; idempotent across
    // restarts and instances.
    let user_ids: std::collections::BTreeSet<String> = gateway
        .config()
        .permits
        .iter()
        .map(|permit| permit.user_id.clone())
        .collect();
    for user_id in user_ids {
        gateway.ledger().ensure_user_account(&user_id).await?;
    }

    let mut state = GatewayHttpState::new(gateway);
    if let Some(token) = admin_token {
        state = state.with_admin_token(token);
    }

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(listen = %listen, sqlite = %sqlite_path.display(), "opendata-gateway listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
