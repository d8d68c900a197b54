use emrtd_test_server::{run_server, Behavior, ServerScript};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let addr = std::env::var("EMRTD_TEST_SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".into());
    let behavior = match std::env::var("EMRTD_TEST_SERVER_BEHAVIOR").as_deref() {
        Ok("reject-access") => Behavior::RejectAccess,
        Ok("invalid-client") => Behavior::InvalidClient,
        Ok("drop-after-accept") => Behavior::DropAfterAccept,
        _ => Behavior::Normal,
    };

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, ?behavior, "validation test server listening");
    run_server(listener, ServerScript::with_behavior(behavior)).await;
    Ok(())
}
