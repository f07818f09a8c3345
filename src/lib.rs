//! Workmode - 浏览器时间记账与休息提醒核心
//!
//! 核心库：把活跃浏览时间按 (域名, 分类) 记账，级联解析页面分类，
//! 并在 rest 类别停留过久时限频提醒。浏览器事件源与界面呈现都在
//! 库外，通过 `EngineHandle` 与通道对接。

pub mod classify;
pub mod commands;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod reminder;
pub mod store;
pub mod time;

use std::sync::Arc;
use tracing::info;

pub use classify::{Classification, Classifier, PageInfo};
pub use commands::{Request, Response};
pub use config::{AppConfig, Settings, Umbrella};
pub use engine::{BrowserEvent, Engine, EngineHandle, EngineNotice};
pub use ledger::Range;
pub use reminder::{ChannelPresenter, RestPresenter, RestPrompt, SystemNotifier};
pub use store::Store;

/// 应用全局状态
pub struct AppState {
    /// 引导配置（TOML 文件）
    pub config: AppConfig,
    /// 键值存储
    pub store: Arc<Store>,
    /// 引擎句柄
    pub engine: EngineHandle,
}

impl AppState {
    /// 创建应用状态：引导配置 → 存储 → 设置 → 引擎
    ///
    /// 需要在 tokio 运行时内调用（引擎事件循环和周期 tick 都是
    /// spawn 出来的任务）。
    pub fn new(presenter: Box<dyn RestPresenter>) -> anyhow::Result<Self> {
        // 1. 加载引导配置（不存在则创建默认）
        let config = AppConfig::load()?;

        // 2. 打开存储
        let store = match &config.storage.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Arc::new(Store::open_at(&dir.join("workmode.db"))?)
            }
            None => Arc::new(Store::open_default()?),
        };

        // 3. 加载用户设置（经过规范化）
        let settings = Settings::load(&store)?;

        // 4. 启动引擎
        let engine = Engine::spawn(store.clone(), settings, presenter);

        info!("Workmode initialized");
        Ok(Self {
            config,
            store,
            engine,
        })
    }
}
