pub mod completion;
pub mod config;
pub mod remote;
pub mod services;

pub use config::Config;
pub use services::Services;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install a stderr subscriber filtered by `NUTRIMATCH_LOG`.
///
/// For host applications; a second call is a no-op.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("NUTRIMATCH_LOG")
        .unwrap_or_else(|_| "nutrimatch=info,nutrimatch_core=info".into());
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

#[cfg(test)]
pub(crate) mod test_support {
    /// Serve `router` on an ephemeral local port and return its base URL.
    pub(crate) async fn serve(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }
}
