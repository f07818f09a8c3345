//! 引擎模块
//!
//! 单消费者事件循环：浏览器事件、周期 tick 和界面请求都排进同一条
//! mpsc 队列，由一个任务串行处理。所有对台账、提醒状态和分类缓存的
//! 修改都发生在这个任务里，"先结算后切换"因此无条件成立。
//!
//! 周期 tick 是一个独立的后台任务，随设置变化停止/重建。

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::classify::{Classifier, PageInfo};
use crate::commands::{
    CategoryData, CategoryMeta, RangeFineStats, Request, Response, ResponseData, TimelineData,
    TodaySnapshot, TopPairsData, UiPrefs,
};
use crate::config::Settings;
use crate::ledger::{self, Ledger};
use crate::reminder::{ModalAction, RemindState, RestPresenter, SystemNotifier};
use crate::store::{Namespace, Store};
use crate::time;

/// 事件适配层投递的浏览器事件
///
/// 核心只消费这些事件，不产生它们。失焦到浏览器之外时事件不带页面。
#[derive(Debug, Clone)]
pub enum BrowserEvent {
    TabActivated { page: PageInfo },
    TabUpdated { page: PageInfo },
    WindowFocusChanged { page: Option<PageInfo> },
}

/// 引擎对外广播的通知（展示层的只读订阅）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum EngineNotice {
    #[serde(rename = "CATEGORY_UPDATED", rename_all = "camelCase")]
    CategoryUpdated {
        category: String,
        cached: bool,
        reason: String,
    },
}

enum Msg {
    Event(BrowserEvent),
    Tick,
    Request(Request, oneshot::Sender<Response>),
    Shutdown,
}

/// 引擎句柄，可克隆，跨任务投递事件与请求
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Msg>,
    notices: broadcast::Sender<EngineNotice>,
}

impl EngineHandle {
    /// 投递一个浏览器事件（引擎已停止时丢弃）
    pub fn send_event(&self, event: BrowserEvent) {
        if self.tx.send(Msg::Event(event)).is_err() {
            warn!("Engine is gone, dropping browser event");
        }
    }

    /// 发送请求并等待应答
    pub async fn request(&self, request: Request) -> Response {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Msg::Request(request, reply_tx)).is_err() {
            return Response::failure("engine stopped");
        }
        reply_rx
            .await
            .unwrap_or_else(|_| Response::failure("engine stopped"))
    }

    /// 订阅引擎通知
    pub fn subscribe(&self) -> broadcast::Receiver<EngineNotice> {
        self.notices.subscribe()
    }

    /// 请求引擎退出事件循环
    pub fn shutdown(&self) {
        let _ = self.tx.send(Msg::Shutdown);
    }
}

/// 引擎：会话状态、提醒状态与分类缓存的唯一属主
pub struct Engine {
    store: Arc<Store>,
    classifier: Arc<Classifier>,
    settings: Settings,
    ledger: Ledger,
    remind: RemindState,
    presenter: Box<dyn RestPresenter>,
    fallback: SystemNotifier,
    notices: broadcast::Sender<EngineNotice>,
    /// 最近一次事件携带的页面，ReclassifyNow 用
    current_page: Option<PageInfo>,
    tx: mpsc::UnboundedSender<Msg>,
    ticker_shutdown: Option<mpsc::Sender<()>>,
}

impl Engine {
    fn new(
        store: Arc<Store>,
        classifier: Arc<Classifier>,
        settings: Settings,
        presenter: Box<dyn RestPresenter>,
        tx: mpsc::UnboundedSender<Msg>,
        notices: broadcast::Sender<EngineNotice>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            store,
            classifier,
            settings,
            ledger: Ledger::new(now),
            remind: RemindState::new(),
            presenter,
            fallback: SystemNotifier,
            notices,
            current_page: None,
            tx,
            ticker_shutdown: None,
        }
    }

    /// 启动引擎事件循环，返回句柄
    pub fn spawn(
        store: Arc<Store>,
        settings: Settings,
        presenter: Box<dyn RestPresenter>,
    ) -> EngineHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(64);
        let engine = Engine::new(
            store,
            Arc::new(Classifier::new()),
            settings,
            presenter,
            tx.clone(),
            notices.clone(),
            Utc::now(),
        );
        let handle = EngineHandle { tx, notices };
        tokio::spawn(engine.run(rx));
        handle
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Msg>) {
        self.restart_ticker();
        info!("Engine loop started");

        while let Some(msg) = rx.recv().await {
            match msg {
                Msg::Event(event) => {
                    if let Err(e) = self.handle_event(event, Utc::now()).await {
                        error!("Browser event handling failed: {}", e);
                    }
                }
                Msg::Tick => {
                    if let Err(e) = self.handle_tick(Utc::now()) {
                        error!("Tick handling failed: {}", e);
                    }
                }
                Msg::Request(request, reply) => {
                    let response = match self.dispatch(request, Utc::now()).await {
                        Ok(data) => Response::success(data),
                        Err(e) => Response::failure(e.to_string()),
                    };
                    let _ = reply.send(response);
                }
                Msg::Shutdown => break,
            }
        }

        self.stop_ticker();
        info!("Engine loop stopped");
    }

    /// 周期 tick 后台任务：停旧建新
    ///
    /// 总开关或提醒策略关闭时不调度（设置变化会再次经过这里）。
    fn restart_ticker(&mut self) {
        self.stop_ticker();
        if !(self.settings.enabled && self.settings.focus_policy.enabled) {
            info!("Periodic tick not scheduled (disabled)");
            return;
        }

        let period_min = self.settings.interval_minutes.max(1) as u64;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.ticker_shutdown = Some(shutdown_tx);

        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(period_min * 60));
            // interval 的第一次 tick 立即完成，跳过
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        if tx.send(Msg::Tick).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        info!("Periodic tick started, period(min) = {}", period_min);
    }

    fn stop_ticker(&mut self) {
        if let Some(tx) = self.ticker_shutdown.take() {
            let _ = tx.try_send(());
        }
    }

    async fn handle_event(&mut self, event: BrowserEvent, now: DateTime<Utc>) -> Result<()> {
        let page = match event {
            BrowserEvent::TabActivated { page } | BrowserEvent::TabUpdated { page } => Some(page),
            BrowserEvent::WindowFocusChanged { page } => page,
        };
        let Some(page) = page else {
            debug!("Focus left the browser, keeping current attribution");
            return Ok(());
        };
        self.current_page = Some(page.clone());
        self.reclassify(&page, now).await
    }

    /// 重新解析活跃页面的分类
    ///
    /// 域名变化先行结算（时间记给旧域名），分类解析完成后走
    /// 先结算后切换的分类应用。
    async fn reclassify(&mut self, page: &PageInfo, now: DateTime<Utc>) -> Result<()> {
        let domain = Classifier::extract_domain(&page.url);
        self.ledger.note_domain(&self.store, &self.settings, &domain, now)?;

        let result = self.classifier.resolve(page, &self.settings).await;
        debug!(
            "Classified {} -> {} ({}, confidence {:.2})",
            domain, result.category, result.reason, result.confidence
        );
        self.apply_classification(&result.category, result.cached, &result.reason, now)
    }

    fn apply_classification(
        &mut self,
        category: &str,
        cached: bool,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ledger
            .apply_category(&self.store, &self.settings, category, now)?;
        let _ = self.notices.send(EngineNotice::CategoryUpdated {
            category: self.ledger.state.current_category.clone(),
            cached,
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn handle_tick(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.settings.enabled {
            return Ok(());
        }
        self.ledger.settle(&self.store, &self.settings, now)?;
        self.check_reminder(now);
        Ok(())
    }

    fn check_reminder(&mut self, now: DateTime<Utc>) {
        let day = time::day_key(&self.settings.time_zone, now);
        let Some(prompt) = self
            .remind
            .check(&self.settings, &self.ledger.state, now, &day)
        else {
            return;
        };

        info!(
            "Rest reminder fired ({} min on rest, {} today)",
            prompt.minutes_on_rest,
            self.remind.count_today() + 1
        );
        if let Err(e) = self.presenter.present(&prompt) {
            warn!(
                "In-page prompt delivery failed ({}), falling back to system notification",
                e
            );
            if let Err(e) = self.fallback.present(&prompt) {
                warn!("System notification failed: {}", e);
            }
        }
        self.remind.record_fired(now);
    }

    async fn dispatch(&mut self, request: Request, now: DateTime<Utc>) -> Result<ResponseData> {
        match request {
            Request::GetTodayStats => {
                let data = ledger::load_day_stats(&self.store, &self.settings, now)?;
                let category = self.ledger.state.current_category.clone();
                Ok(ResponseData::TodayStats(TodaySnapshot {
                    umbrella: self.settings.map_to_umbrella(&category),
                    data,
                    category,
                    last_switch_ts: self.ledger.state.last_switch.timestamp_millis(),
                    current_domain: self.ledger.state.current_domain.clone(),
                }))
            }
            Request::GetStatsRangeFine { range } => {
                let range = range.unwrap_or(self.settings.pie_range);
                let raw = ledger::range_totals(&self.store, &self.settings, range, now)?;
                let mut totals_fine = BTreeMap::new();
                let mut categories_meta = Vec::new();
                for category in &self.settings.categories_config {
                    totals_fine.insert(
                        category.name.clone(),
                        raw.get(&category.name).copied().unwrap_or(0),
                    );
                    categories_meta.push(CategoryMeta {
                        name: category.name.clone(),
                        umbrella: category.umbrella,
                    });
                }
                Ok(ResponseData::RangeFine(RangeFineStats {
                    totals_fine,
                    range,
                    categories_meta,
                }))
            }
            Request::GetTopDomainPairsRange { range, limit } => {
                let range = range.unwrap_or(self.settings.pie_range);
                let top_domain_pairs = ledger::top_domain_pairs(
                    &self.store,
                    &self.settings,
                    range,
                    limit.unwrap_or(10),
                    now,
                )?;
                Ok(ResponseData::TopPairs(TopPairsData {
                    top_domain_pairs,
                    range,
                }))
            }
            Request::GetTimelineRange { range } => {
                let range = range.unwrap_or(self.settings.pie_range);
                let segs = ledger::collect_segments(&self.store, &self.settings, range, now)?;
                Ok(ResponseData::Timeline(TimelineData { segs, range }))
            }
            Request::ReclassifyNow => {
                if let Some(page) = self.current_page.clone() {
                    self.reclassify(&page, now).await?;
                }
                Ok(ResponseData::Category(CategoryData {
                    category: self.ledger.state.current_category.clone(),
                }))
            }
            Request::GetUiPrefs => Ok(ResponseData::UiPrefs {
                prefs: UiPrefs::from_settings(&self.settings),
            }),
            Request::SetUiPrefs { prefs } => {
                if let Some(pie_range) = prefs.pie_range {
                    self.settings.pie_range = pie_range;
                }
                if let Some(show) = prefs.show_category_table {
                    self.settings.show_category_table = show;
                }
                if let Some(collapsed) = prefs.pairs_collapsed {
                    self.settings.pairs_collapsed = collapsed;
                }
                if let Some(colors) = prefs.category_colors {
                    self.settings.category_colors = colors;
                }
                if let Some(time_zone) = prefs.time_zone {
                    self.settings.time_zone = time_zone;
                }
                self.settings.save(&self.store)?;
                Ok(ResponseData::Empty {})
            }
            Request::GetRestAlarm => Ok(ResponseData::RestAlarm {
                enabled: self.settings.focus_policy.enabled,
            }),
            Request::SetRestAlarm { value } => {
                self.settings.focus_policy.enabled = value;
                self.settings.save(&self.store)?;
                self.restart_ticker();
                Ok(ResponseData::Empty {})
            }
            Request::SetManualCategory { category } => {
                let Some(canonical) = self
                    .settings
                    .canonical_category(&category)
                    .map(str::to_string)
                else {
                    return Err(anyhow!("invalid category"));
                };
                self.apply_classification(&canonical, false, "manual", now)?;
                Ok(ResponseData::Empty {})
            }
            Request::SetCategoryColor { name, color } => {
                self.settings.category_colors.insert(name, color);
                self.settings.save(&self.store)?;
                Ok(ResponseData::Empty {})
            }
            Request::ClearAllData => {
                let cleared = self
                    .store
                    .remove_prefixed(Namespace::Local, &["stats:", "segments:"])?;
                self.ledger.reset_accrual_clock(now);
                info!("Cleared {} tracking records", cleared);
                Ok(ResponseData::Cleared { cleared })
            }
            Request::RestModalAction { action } => {
                if action == ModalAction::Disable {
                    self.settings.focus_policy.enabled = false;
                    self.settings.save(&self.store)?;
                    self.restart_ticker();
                } else {
                    self.remind.apply_modal_action(action, now);
                }
                Ok(ResponseData::Empty {})
            }
            Request::GetSettings => Ok(ResponseData::Settings {
                settings: self.settings.clone(),
            }),
            Request::UpdateSettings { settings: incoming } => {
                let mut incoming = incoming;
                incoming.normalize();
                let categories_changed =
                    incoming.categories_config != self.settings.categories_config;
                let tick_changed = incoming.enabled != self.settings.enabled
                    || incoming.interval_minutes != self.settings.interval_minutes
                    || incoming.focus_policy.enabled != self.settings.focus_policy.enabled;

                incoming.save(&self.store)?;
                self.settings = incoming;

                if categories_changed {
                    self.classifier.invalidate_cache();
                }
                if tick_changed {
                    self.restart_ticker();
                }
                Ok(ResponseData::Empty {})
            }
        }
    }
}
