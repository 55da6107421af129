//! 設定
//!
//! TOML設定ファイルの読み込みを提供します。設定は明示的な
//! コンテキストオブジェクトとして各コンポーネントのコンストラクタへ
//! 渡されます（プロセスグローバルな状態は持ちません）。
//!
//! ## 設定例
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:8080"
//!
//! [store]
//! bucket = "my-site-bucket"
//! region = "ap-northeast-1"
//! # endpoint = "http://127.0.0.1:9000/my-site-bucket"  # MinIO等の上書き用
//!
//! [cache]
//! dir = "/var/cache/kagami"
//! ttl_secs = 60
//! ```

use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};

/// デフォルト値関数
fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/cache/kagami")
}
fn default_ttl() -> u64 {
    60 // 1分
}

/// 設定全体
#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    pub store: StoreSection,
    #[serde(default)]
    pub cache: CacheSection,
}

/// サーバー設定
#[derive(Deserialize, Clone, Debug)]
pub struct ServerSection {
    /// リッスンアドレス
    ///
    /// デフォルト: 127.0.0.1:8080
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// オブジェクトストレージ設定
#[derive(Deserialize, Clone, Debug)]
pub struct StoreSection {
    /// バケット名
    pub bucket: String,
    /// リージョン
    pub region: String,
    /// エンドポイントURLの上書き（MinIO等）
    ///
    /// 未設定の場合は仮想ホスト形式のAWSエンドポイントを使用
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl StoreSection {
    /// 実際に使用するエンドポイントURL
    pub fn endpoint_url(&self) -> String {
        match &self.endpoint {
            Some(url) => url.clone(),
            None => format!("https://{}.s3.{}.amazonaws.com", self.bucket, self.region),
        }
    }
}

/// キャッシュ設定
#[derive(Deserialize, Clone, Debug)]
pub struct CacheSection {
    /// キャッシュディレクトリ
    ///
    /// デフォルト: /var/cache/kagami
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    /// キャッシュTTL（秒）
    ///
    /// エントリの経過時間（現在時刻 - mtime）がこの値未満の間だけ有効
    ///
    /// デフォルト: 60秒
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            ttl_secs: default_ttl(),
        }
    }
}

/// 設定ファイルを読み込む
pub fn load_config(path: &Path) -> io::Result<Config> {
    let config_str = std::fs::read_to_string(path)?;
    toml::from_str(&config_str).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("TOML parse error: {}", e),
        )
    })
}
