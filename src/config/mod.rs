//! 配置管理模块
//!
//! 两层配置：
//! - `AppConfig`：进程引导配置，TOML 文件存储，遵循 XDG 规范
//!   （Linux: ~/.config/workmode/Workmode/config.toml）
//! - `Settings`：用户设置实体，整体以 JSON 存放在存储的 sync 命名空间，
//!   读取时经过统一的规范化步骤（缺省分类表、保底 "other" 分类）。

use anyhow::{anyhow, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::ledger::Range;
use crate::store::{Namespace, Store};

/// sync 命名空间中设置实体的键
pub const SETTINGS_KEY: &str = "settings";

/// 粗粒度伞类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Umbrella {
    Work,
    Rest,
    Other,
}

impl fmt::Display for Umbrella {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Umbrella::Work => write!(f, "work"),
            Umbrella::Rest => write!(f, "rest"),
            Umbrella::Other => write!(f, "other"),
        }
    }
}

/// 细分类配置项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub name: String,
    pub umbrella: Umbrella,
}

impl CategoryConfig {
    pub fn new(name: &str, umbrella: Umbrella) -> Self {
        Self {
            name: name.to_string(),
            umbrella,
        }
    }
}

/// 休息提醒策略参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusPolicy {
    #[serde(default = "default_policy_enabled")]
    pub enabled: bool,
    #[serde(default = "default_soft_after_min")]
    pub soft_after_min: u32,
    #[serde(default = "default_hard_after_min")]
    pub hard_after_min: u32,
    #[serde(default = "default_cooldown_min")]
    pub cooldown_min: u32,
    #[serde(default = "default_daily_max")]
    pub daily_max: u32,
}

fn default_policy_enabled() -> bool {
    true
}
fn default_soft_after_min() -> u32 {
    5
}
fn default_hard_after_min() -> u32 {
    15
}
fn default_cooldown_min() -> u32 {
    10
}
fn default_daily_max() -> u32 {
    8
}

impl Default for FocusPolicy {
    fn default() -> Self {
        Self {
            enabled: default_policy_enabled(),
            soft_after_min: default_soft_after_min(),
            hard_after_min: default_hard_after_min(),
            cooldown_min: default_cooldown_min(),
            daily_max: default_daily_max(),
        }
    }
}

/// 用户设置实体
///
/// 与持久化格式一一对应（camelCase 键），任何字段缺失都有默认值。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// 周期统计的总开关
    pub enabled: bool,
    /// 定时器周期（分钟），同时是休息提醒阈值的来源
    pub interval_minutes: u32,
    /// Gemini API 密钥，空串表示未配置远程推理
    pub api_key: String,
    /// 首选模型名
    pub model: String,
    /// 细分类与伞类别的有序配置
    pub categories_config: Vec<CategoryConfig>,
    /// IANA 时区标识符
    pub time_zone: String,
    /// 域名到分类名的学习规则
    pub learned_rules: BTreeMap<String, String>,
    /// 分类显示颜色（仅展示层使用）
    pub category_colors: BTreeMap<String, String>,
    /// 饼图默认时间范围
    pub pie_range: Range,
    /// 是否显示分类明细表
    pub show_category_table: bool,
    /// 域名对列表是否折叠
    pub pairs_collapsed: bool,
    /// 休息提醒策略
    pub focus_policy: FocusPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 5,
            api_key: String::new(),
            model: "gemini-2.0-flash".to_string(),
            categories_config: Self::default_categories(),
            time_zone: "America/Chicago".to_string(),
            learned_rules: BTreeMap::new(),
            category_colors: BTreeMap::new(),
            pie_range: Range::OneDay,
            show_category_table: true,
            pairs_collapsed: false,
            focus_policy: FocusPolicy::default(),
        }
    }
}

impl Settings {
    /// 内建默认分类表
    pub fn default_categories() -> Vec<CategoryConfig> {
        vec![
            CategoryConfig::new("work", Umbrella::Work),
            CategoryConfig::new("study", Umbrella::Work),
            CategoryConfig::new("utility", Umbrella::Work),
            CategoryConfig::new("social", Umbrella::Rest),
            CategoryConfig::new("entertainment", Umbrella::Rest),
            CategoryConfig::new("other", Umbrella::Other),
        ]
    }

    /// 从存储加载设置（不存在则返回默认值），并做统一规范化
    pub fn load(store: &Store) -> Result<Self> {
        let mut settings: Settings = store
            .get(Namespace::Sync, SETTINGS_KEY)?
            .unwrap_or_default();
        settings.normalize();
        Ok(settings)
    }

    /// 持久化设置实体
    pub fn save(&self, store: &Store) -> Result<()> {
        store.set(Namespace::Sync, SETTINGS_KEY, self)?;
        debug!("Settings saved");
        Ok(())
    }

    /// 加载时的规范化：空分类表替换为默认表，保证存在 "other" 分类
    pub fn normalize(&mut self) {
        if self.categories_config.is_empty() {
            self.categories_config = Self::default_categories();
        }
        let has_other = self
            .categories_config
            .iter()
            .any(|c| c.name.eq_ignore_ascii_case("other"));
        if !has_other {
            warn!("Category config lacks 'other', appending fallback entry");
            self.categories_config
                .push(CategoryConfig::new("other", Umbrella::Other));
        }
    }

    /// 细分类名到伞类别的映射（大小写不敏感，未命中归 Other）
    pub fn map_to_umbrella(&self, fine: &str) -> Umbrella {
        self.categories_config
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(fine))
            .map(|c| c.umbrella)
            .unwrap_or(Umbrella::Other)
    }

    /// 按大小写不敏感匹配返回配置中的规范分类名
    pub fn canonical_category(&self, name: &str) -> Option<&str> {
        self.categories_config
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .map(|c| c.name.as_str())
    }

    /// 全部配置的分类名（保持配置顺序）
    pub fn category_names(&self) -> Vec<&str> {
        self.categories_config.iter().map(|c| c.name.as_str()).collect()
    }

    /// rest 伞下的分类名
    pub fn rest_categories(&self) -> Vec<&str> {
        self.categories_config
            .iter()
            .filter(|c| c.umbrella == Umbrella::Rest)
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// 存储引导配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 数据目录覆盖，未设置时使用 XDG 数据目录
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

/// 应用引导配置（顶层结构）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 数据存储配置
    #[serde(default)]
    pub storage: StorageConfig,
}

impl AppConfig {
    /// 获取配置目录路径
    pub fn config_dir() -> Result<PathBuf> {
        if let Some(proj_dirs) = ProjectDirs::from("com", "workmode", "Workmode") {
            Ok(proj_dirs.config_dir().to_path_buf())
        } else {
            // 回退到 ~/.workmode
            let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot find home directory"))?;
            Ok(home.join(".workmode"))
        }
    }

    /// 获取配置文件完整路径
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// 从文件加载配置
    ///
    /// 如果文件不存在，返回默认配置并创建文件
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        debug!("Loading config from: {}", path.display());

        if path.exists() {
            let content = fs::read_to_string(&path)?;
            let config: Self = toml::from_str(&content).map_err(|e| {
                warn!("Failed to parse config file: {}, using defaults", e);
                e
            })?;
            info!("Config loaded from: {}", path.display());
            Ok(config)
        } else {
            info!("Config file not found, creating default at: {}", path.display());
            let config = Self::default();
            config.save()?;
            Ok(config)
        }
    }

    /// 保存配置到文件
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        let dir = path.parent().ok_or_else(|| anyhow!("Invalid config path"))?;

        if !dir.exists() {
            fs::create_dir_all(dir)?;
            debug!("Created config directory: {}", dir.display());
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, &content)?;

        // 设置文件权限 (Unix only) - 仅用户可读写
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&path, perms)?;
        }

        info!("Config saved to: {}", path.display());
        Ok(())
    }
}
