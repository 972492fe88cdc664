use std::process::ExitCode;
use std::sync::Arc;

use cowrite::server::{self, AppState};
use cowrite::{RoomRegistry, Settings};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let settings = Arc::new(Settings::from_env());
    log::info!(
        "starting cowrite on {} (persist dir {})",
        settings.listen_addr,
        settings.persist_dir.display()
    );

    let registry = match RoomRegistry::open(settings.clone()) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            log::error!(
                "cannot open persistence directory {}: {e}",
                settings.persist_dir.display()
            );
            return ExitCode::FAILURE;
        }
    };

    let restored = registry.restore_all().await;
    if restored > 0 {
        log::info!("restored {restored} rooms from disk");
    }

    tokio::spawn(registry.clone().run_sweeper());

    let state = AppState::new(registry.clone());
    if let Err(e) = server::serve(state).await {
        log::error!("server failed: {e}");
        return ExitCode::FAILURE;
    }

    log::info!("terminating, flushing all rooms");
    registry.flush_all().await;
    ExitCode::SUCCESS
}
