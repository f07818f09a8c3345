//! 键值存储模块
//!
//! 使用 SQLite 提供两个命名空间的 get/set 键值服务：
//! - `sync`：用户设置（整体存放 Settings 实体）
//! - `local`：按天分片的统计与时间线数据
//!
//! 值一律序列化为 JSON 文本。连接持有 `Mutex`，对同一键的写入天然串行。

use anyhow::Result;
use directories::ProjectDirs;
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// 存储命名空间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// 设置（跨设备同步语义）
    Sync,
    /// 本地统计数据
    Local,
}

impl Namespace {
    fn as_str(self) -> &'static str {
        match self {
            Namespace::Sync => "sync",
            Namespace::Local => "local",
        }
    }
}

/// 键值存储
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// 在默认数据目录创建或打开存储
    pub fn open_default() -> Result<Self> {
        let data_dir = Self::resolve_data_dir()?;
        fs::create_dir_all(&data_dir)?;

        let db_path = data_dir.join("workmode.db");
        info!("Opening store at: {:?}", db_path);
        Self::open_at(&db_path)
    }

    /// 打开指定路径的存储文件
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// 打开内存存储（测试用）
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                ns    TEXT NOT NULL,
                key   TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (ns, key)
            )
            "#,
            [],
        )?;
        Ok(())
    }

    /// 获取数据目录（静态方法）
    fn resolve_data_dir() -> Result<PathBuf> {
        if let Some(proj_dirs) = ProjectDirs::from("com", "workmode", "Workmode") {
            Ok(proj_dirs.data_dir().to_path_buf())
        } else {
            // 回退到用户目录
            let home =
                dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot find home directory"))?;
            Ok(home.join(".workmode"))
        }
    }

    /// 读取并反序列化一个键，不存在时返回 None
    pub fn get<T: DeserializeOwned>(&self, ns: Namespace, key: &str) -> Result<Option<T>> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT value FROM kv WHERE ns = ?1 AND key = ?2",
            rusqlite::params![ns.as_str(), key],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(value) => Ok(Some(serde_json::from_str(&value)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// 序列化并写入一个键（存在则覆盖）
    pub fn set<T: Serialize>(&self, ns: Namespace, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO kv (ns, key, value) VALUES (?1, ?2, ?3)
            ON CONFLICT (ns, key) DO UPDATE SET value = excluded.value
            "#,
            rusqlite::params![ns.as_str(), key, json],
        )?;
        Ok(())
    }

    /// 删除命名空间内以任一前缀开头的所有键，返回删除数量
    pub fn remove_prefixed(&self, ns: Namespace, prefixes: &[&str]) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let mut removed = 0usize;
        for prefix in prefixes {
            let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
            removed += conn.execute(
                "DELETE FROM kv WHERE ns = ?1 AND key LIKE ?2 ESCAPE '\\'",
                rusqlite::params![ns.as_str(), pattern],
            )?;
        }
        debug!("Removed {} keys from {:?}", removed, ns);
        Ok(removed)
    }
}
