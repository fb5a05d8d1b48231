use mock_server::MockState;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut state = MockState::new();
    if let (Ok(domain), Ok(name), Ok(password)) = (
        std::env::var("MOCK_DOMAIN"),
        std::env::var("MOCK_USERNAME"),
        std::env::var("MOCK_PASSWORD"),
    ) {
        tracing::info!(domain = %domain, name = %name, "registering user");
        state = state.with_user(&domain, &name, &password);
    }

    let port = std::env::var("PORT").unwrap_or_else(|_| "1026".to_string());
    let addr = format!("127.0.0.1:{port}");
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("listening on {addr}");
    mock_server::run_with_state(listener, state).await
}
