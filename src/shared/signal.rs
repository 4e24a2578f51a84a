//! Process termination handling.

use tokio::signal;
use tokio::sync::oneshot;

/// Resolves on SIGINT, SIGTERM, or when the user asks for a shutdown through
/// `shutdown_from_user`.
pub(crate) async fn shutdown_signal(shutdown_from_user: Option<oneshot::Receiver<()>>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    let shutdown_from_user_future = async {
        match shutdown_from_user {
            Some(rx) => {
                rx.await.ok();
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown_from_user_future => {},
    }
}
