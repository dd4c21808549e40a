//! Container entry point for the proxy front-end.
//!
//! The orchestrator attaches to this process's stdin/stdout and speaks the
//! yamux transport over them. HTTP from the simulator network is accepted on
//! the well-known front-end port.

use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let listener = TcpListener::bind(("0.0.0.0", hiveproxy::FRONTEND_PORT)).await?;
    let conn = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());
    hiveproxy::run_frontend(conn, listener).await?;
    Ok(())
}
