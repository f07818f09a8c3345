//! Workmode 主入口

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use workmode::{AppState, ChannelPresenter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("workmode=debug".parse().unwrap()))
        .init();

    info!("Starting Workmode v{}", env!("CARGO_PKG_VERSION"));

    let (presenter, mut prompts) = ChannelPresenter::new();
    let state = AppState::new(Box::new(presenter))?;

    // 守护进程没有页面内展示层，休息提醒直接打到日志
    tokio::spawn(async move {
        while let Some(prompt) = prompts.recv().await {
            info!(
                "Rest prompt: {} minutes on rest (threshold: {} minutes)",
                prompt.minutes_on_rest, prompt.threshold_minutes
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    state.engine.shutdown();
    Ok(())
}
